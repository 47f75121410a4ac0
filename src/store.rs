//! Settings and inbound collaborators
//!
//! The supervisor only needs a config template and the list of inbounds, so
//! both are reached through small traits. [`FileStore`] is a JSON-file backed
//! implementation used by the binary; anything else (a database, a test fake)
//! can be plugged in instead.

use crate::traffic::Traffic;
use crate::xray_config::InboundConfig;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of the stored Xray config template
pub trait SettingStore: Send + Sync {
    /// The template document as JSON text
    fn xray_config_template(&self) -> Result<String>;
}

/// Persistence for inbounds and their traffic accounting
pub trait InboundStore: Send + Sync {
    fn all_inbounds(&self) -> Result<Vec<Inbound>>;

    /// Enabled inbounds in storage order
    fn enabled_inbounds(&self) -> Result<Vec<Inbound>> {
        Ok(self
            .all_inbounds()?
            .into_iter()
            .filter(|inbound| inbound.enable)
            .collect())
    }

    /// Add per-tag traffic deltas to the matching inbounds
    fn add_traffic(&self, traffics: &[Traffic]) -> Result<()>;

    /// Disable enabled inbounds whose expiry time has passed; returns how many
    fn disable_invalid_inbounds(&self) -> Result<usize>;

    /// Disable enabled inbounds that used up their traffic quota; returns how many
    fn disable_exhausted_inbounds(&self) -> Result<usize>;
}

/// A stored inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
    /// Bytes sent by clients
    #[serde(default)]
    pub up: i64,
    /// Bytes received by clients
    #[serde(default)]
    pub down: i64,
    /// Traffic quota in bytes, 0 for unlimited
    #[serde(default)]
    pub total: i64,
    /// Unix time in milliseconds after which the inbound is disabled, 0 for never
    #[serde(default)]
    pub expiry_time: i64,
}

fn default_enable() -> bool {
    true
}

impl Inbound {
    /// The fragment this inbound contributes to the Xray config
    pub fn xray_inbound_config(&self) -> InboundConfig {
        InboundConfig {
            listen: self
                .listen
                .as_ref()
                .filter(|listen| !listen.is_empty())
                .map(|listen| Value::String(listen.clone())),
            port: self.port,
            protocol: self.protocol.clone(),
            settings: self.settings.clone(),
            stream_settings: self.stream_settings.clone(),
            tag: self.tag.clone(),
            sniffing: self.sniffing.clone(),
            extra: Default::default(),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_time > 0 && self.expiry_time <= now_ms
    }

    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.up + self.down >= self.total
    }
}

/// JSON-file backed settings and inbound store
///
/// Every read goes back to disk so edits made outside the panel are seen by
/// the next config build. Writes replace the inbound file atomically.
pub struct FileStore {
    template_path: PathBuf,
    inbounds_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(template_path: impl Into<PathBuf>, inbounds_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            inbounds_path: inbounds_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_inbounds(&self) -> Result<Vec<Inbound>> {
        if !self.inbounds_path.exists() {
            debug!(path = %self.inbounds_path.display(), "Inbound file missing, treating as empty");
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.inbounds_path).with_context(|| {
            format!("Failed to read inbounds from {}", self.inbounds_path.display())
        })?;
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse inbounds in {}", self.inbounds_path.display())
        })
    }

    fn write_inbounds(&self, inbounds: &[Inbound]) -> Result<()> {
        let data = serde_json::to_string_pretty(inbounds)?;
        write_atomic(&self.inbounds_path, data.as_bytes())
    }

    /// Read, modify and write back the inbound list under the write lock
    fn update_inbounds<T>(&self, f: impl FnOnce(&mut Vec<Inbound>) -> T) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut inbounds = self.read_inbounds()?;
        let result = f(&mut inbounds);
        self.write_inbounds(&inbounds)?;
        Ok(result)
    }

    fn disable_where(&self, reason: &str, pred: impl Fn(&Inbound) -> bool) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut inbounds = self.read_inbounds()?;
        let mut count = 0;
        for inbound in inbounds.iter_mut().filter(|i| i.enable && pred(i)) {
            inbound.enable = false;
            count += 1;
            info!(id = inbound.id, tag = %inbound.tag, reason, "Disabling inbound");
        }
        if count > 0 {
            self.write_inbounds(&inbounds)?;
        }
        Ok(count)
    }
}

impl SettingStore for FileStore {
    fn xray_config_template(&self) -> Result<String> {
        std::fs::read_to_string(&self.template_path).with_context(|| {
            format!(
                "Failed to read xray config template {}",
                self.template_path.display()
            )
        })
    }
}

impl InboundStore for FileStore {
    fn all_inbounds(&self) -> Result<Vec<Inbound>> {
        self.read_inbounds()
    }

    fn add_traffic(&self, traffics: &[Traffic]) -> Result<()> {
        let inbound_traffics: Vec<&Traffic> = traffics
            .iter()
            .filter(|t| t.is_inbound && (t.up != 0 || t.down != 0))
            .collect();
        if inbound_traffics.is_empty() {
            return Ok(());
        }

        self.update_inbounds(|inbounds| {
            for traffic in inbound_traffics {
                if let Some(inbound) = inbounds.iter_mut().find(|i| i.tag == traffic.tag) {
                    inbound.up += traffic.up;
                    inbound.down += traffic.down;
                }
            }
        })
    }

    fn disable_invalid_inbounds(&self) -> Result<usize> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.disable_where("expired", |inbound| inbound.is_expired(now_ms))
    }

    fn disable_exhausted_inbounds(&self) -> Result<usize> {
        self.disable_where("traffic exhausted", Inbound::is_exhausted)
    }
}

/// Write to a sibling temp file, then rename over the target
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
