use crate::process::XrayPaths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Panel configuration, loaded from a TOML file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Managed binary, its files and cache lifetimes
    #[serde(default)]
    pub xray: XrayConfigSection,

    /// Periodic job timings
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Where the config template and inbounds are stored
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Admin API port (default: 54321)
    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Bearer token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_admin_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct XrayConfigSection {
    /// Directory holding the binary and generated config (default: ./bin)
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,

    /// Binary path, overriding `<bin_dir>/xray-<os>-<arch>`
    pub binary: Option<String>,

    /// Generated config path, overriding `<bin_dir>/config.json`
    pub config_path: Option<String>,

    /// Start xray when the panel starts (default: true)
    #[serde(default = "default_true")]
    pub start_on_launch: bool,

    /// How long a built config is reused, in seconds (default: 300)
    #[serde(default = "default_config_cache_ttl")]
    pub config_cache_ttl_secs: u64,

    /// How long fetched traffic counters are reused, in milliseconds (default: 2000)
    #[serde(default = "default_traffic_cache_ttl")]
    pub traffic_cache_ttl_ms: u64,

    /// Deadline for dialing and querying the stats API, in seconds (default: 5)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

impl Default for XrayConfigSection {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            binary: None,
            config_path: None,
            start_on_launch: true,
            config_cache_ttl_secs: default_config_cache_ttl(),
            traffic_cache_ttl_ms: default_traffic_cache_ttl(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

impl XrayConfigSection {
    pub fn paths(&self) -> XrayPaths {
        let mut paths = XrayPaths::in_dir(&self.bin_dir);
        if let Some(ref binary) = self.binary {
            paths.binary = PathBuf::from(binary);
        }
        if let Some(ref config_path) = self.config_path {
            paths.config = PathBuf::from(config_path);
        }
        paths
    }

    pub fn config_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config_cache_ttl_secs)
    }

    pub fn traffic_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.traffic_cache_ttl_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// How often pending restart requests are checked, in seconds (default: 30)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Minimum time between reconciliation restarts, in seconds (default: 300)
    #[serde(default = "default_min_restart_interval")]
    pub min_restart_interval_secs: u64,

    /// How often traffic is collected, in seconds (default: 10)
    #[serde(default = "default_traffic_interval")]
    pub traffic_interval_secs: u64,

    /// How often expiry and quota are enforced, in seconds (default: 180)
    #[serde(default = "default_enforcement_interval")]
    pub enforcement_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            min_restart_interval_secs: default_min_restart_interval(),
            traffic_interval_secs: default_traffic_interval(),
            enforcement_interval_secs: default_enforcement_interval(),
        }
    }
}

impl JobsConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn min_restart_interval(&self) -> Duration {
        Duration::from_secs(self.min_restart_interval_secs)
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_interval_secs)
    }

    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_secs(self.enforcement_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Xray config template (JSON)
    #[serde(default = "default_template_path")]
    pub template_path: String,

    /// Inbound list (JSON array)
    #[serde(default = "default_inbounds_path")]
    pub inbounds_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            template_path: default_template_path(),
            inbounds_path: default_inbounds_path(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    54321
}

fn default_bin_dir() -> String {
    "./bin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_config_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_traffic_cache_ttl() -> u64 {
    2000 // 2 seconds
}

fn default_rpc_timeout() -> u64 {
    5
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_min_restart_interval() -> u64 {
    300 // 5 minutes between reconciliation restarts
}

fn default_traffic_interval() -> u64 {
    10
}

fn default_enforcement_interval() -> u64 {
    180 // 3 minutes
}

fn default_template_path() -> String {
    "./xray_template.json".to_string()
}

fn default_inbounds_path() -> String {
    "./inbounds.json".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.xray.rpc_timeout_secs == 0 {
            errors.push("xray.rpc_timeout_secs must be greater than 0".to_string());
        }
        for (name, value) in [
            ("jobs.reconcile_interval_secs", self.jobs.reconcile_interval_secs),
            ("jobs.traffic_interval_secs", self.jobs.traffic_interval_secs),
            ("jobs.enforcement_interval_secs", self.jobs.enforcement_interval_secs),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}
