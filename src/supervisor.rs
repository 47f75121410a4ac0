//! The single authority over the live Xray process.
//!
//! Restart and stop requests from the admin API, the reconciliation job and
//! binary replacement all funnel through [`Supervisor`], which serializes them
//! on one lock. Readers (status, traffic) never take that lock; they clone the
//! current process handle and may observe either the old or the new process
//! while a restart is in flight.

use crate::config_builder::ConfigBuilder;
use crate::error::{XrayError, XrayResult};
use crate::process::{ManagedProcess, XrayPaths, UNKNOWN_VERSION};
use crate::stats::StatsQuery;
use crate::traffic::Traffic;
use crate::xray_config::XrayConfig;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long teardown paths wait for a killed process to be reaped
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coarse process state reported by [`Supervisor::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XrayState {
    Running,
    Stop,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XrayStatus {
    pub state: XrayState,
    pub error_msg: String,
    pub version: String,
}

/// Output of `xray x25519`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// What a reconciliation step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No restart was requested
    Idle,
    /// A restart was requested too soon after the last one and re-armed
    Deferred,
    /// The freshly built config matched the running one
    Unchanged,
    Restarted,
    Failed,
}

/// State only touched while the restart lock is held
#[derive(Debug, Default)]
struct RestartState {
    /// Last restart attempted by reconciliation
    last_restart: Option<Instant>,
}

/// Settings the supervisor hands to every process it creates
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub paths: XrayPaths,
    pub traffic_cache_ttl: Duration,
}

pub struct Supervisor {
    builder: ConfigBuilder,
    stats: Arc<dyn StatsQuery>,
    settings: SupervisorSettings,
    /// Held for the whole stop/build/start sequence
    restart_lock: tokio::sync::Mutex<RestartState>,
    /// Only replaced while `restart_lock` is held
    process: RwLock<Option<Arc<ManagedProcess>>>,
    need_restart: AtomicBool,
}

impl Supervisor {
    pub fn new(
        builder: ConfigBuilder,
        stats: Arc<dyn StatsQuery>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            builder,
            stats,
            settings,
            restart_lock: tokio::sync::Mutex::new(RestartState::default()),
            process: RwLock::new(None),
            need_restart: AtomicBool::new(false),
        })
    }

    pub fn config_builder(&self) -> &ConfigBuilder {
        &self.builder
    }

    pub fn paths(&self) -> &XrayPaths {
        &self.settings.paths
    }

    /// The current process handle, running or not
    pub fn process(&self) -> Option<Arc<ManagedProcess>> {
        self.process.read().clone()
    }

    fn running_process(&self) -> Option<Arc<ManagedProcess>> {
        self.process().filter(|process| process.is_running())
    }

    pub fn is_xray_running(&self) -> bool {
        self.running_process().is_some()
    }

    pub fn get_xray_err(&self) -> Option<String> {
        self.process().and_then(|process| process.error())
    }

    /// Captured output of a process that is no longer running
    pub fn get_xray_result(&self) -> String {
        match self.process() {
            Some(process) if !process.is_running() => process.result(),
            _ => String::new(),
        }
    }

    pub fn get_xray_version(&self) -> String {
        self.process()
            .map(|process| process.version())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    pub fn get_xray_config(&self) -> XrayResult<Arc<XrayConfig>> {
        self.builder.build()
    }

    pub fn status(&self) -> XrayStatus {
        if self.is_xray_running() {
            return XrayStatus {
                state: XrayState::Running,
                error_msg: String::new(),
                version: self.get_xray_version(),
            };
        }
        match self.get_xray_err() {
            Some(err) => XrayStatus {
                state: XrayState::Error,
                error_msg: err,
                version: self.get_xray_version(),
            },
            None => XrayStatus {
                state: XrayState::Stop,
                error_msg: self.get_xray_result(),
                version: self.get_xray_version(),
            },
        }
    }

    /// Replace the running process unless it already runs the current config.
    ///
    /// With `force` the process is replaced even when the config is unchanged.
    /// Returns whether a new process was started.
    pub async fn restart_xray(&self, force: bool) -> XrayResult<bool> {
        let _guard = self.restart_lock.lock().await;
        self.restart_locked(force).await
    }

    /// Consume a pending restart request and apply it unless the last
    /// reconciliation restart was less than `min_interval` ago.
    ///
    /// A deferred request is re-armed. An applied one always rebuilds the
    /// config, since requests are raised after the stores changed.
    pub async fn reconcile(&self, min_interval: Duration) -> ReconcileOutcome {
        let mut state = self.restart_lock.lock().await;
        if !self.is_need_restart_and_set_false() {
            return ReconcileOutcome::Idle;
        }

        let now = Instant::now();
        if let Some(last) = state.last_restart {
            let since = now.duration_since(last);
            if since < min_interval {
                info!(
                    since_secs = since.as_secs(),
                    min_interval_secs = min_interval.as_secs(),
                    "Xray restart requested too soon, deferring"
                );
                self.set_to_need_restart();
                return ReconcileOutcome::Deferred;
            }
        }
        state.last_restart = Some(now);

        self.builder.invalidate();
        match self.restart_locked(false).await {
            Ok(true) => ReconcileOutcome::Restarted,
            Ok(false) => ReconcileOutcome::Unchanged,
            Err(e) => {
                warn!(error = %e, "Failed to restart xray");
                ReconcileOutcome::Failed
            }
        }
    }

    /// Caller holds `restart_lock`
    async fn restart_locked(&self, force: bool) -> XrayResult<bool> {
        debug!(force, "Restarting xray");

        let config = self.builder.build()?;

        if let Some(process) = self.running_process() {
            if !force && process.config().as_ref() == config.as_ref() {
                debug!("Xray config unchanged, skipping restart");
                return Ok(false);
            }
            if let Err(e) = process.stop() {
                warn!(error = %e, "Failed to stop xray before restart");
            }
        }

        self.invalidate_cache();
        let process = ManagedProcess::new(
            config,
            self.settings.paths.clone(),
            Arc::clone(&self.stats),
            self.settings.traffic_cache_ttl,
        );
        *self.process.write() = Some(Arc::clone(&process));

        process.start().await?;
        Ok(true)
    }

    pub async fn stop_xray(&self) -> XrayResult<()> {
        let _guard = self.restart_lock.lock().await;
        debug!("Stopping xray");

        let process = self.running_process().ok_or(XrayError::NotRunning)?;
        self.invalidate_cache();
        process.stop()
    }

    pub fn set_to_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    /// Consume a pending restart request; only one caller sees each request
    pub fn is_need_restart_and_set_false(&self) -> bool {
        self.need_restart
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Drop the cached config and the live process's cached counters
    pub fn invalidate_cache(&self) {
        self.builder.invalidate();
        if let Some(process) = self.process() {
            process.traffic_cache().invalidate();
        }
    }

    pub async fn get_traffic(&self, reset: bool) -> XrayResult<Vec<Traffic>> {
        let process = self.running_process().ok_or(XrayError::NotRunning)?;
        process.get_traffic(reset).await
    }

    /// Run `xray x25519` and parse the generated key pair
    pub async fn generate_reality_key_pair(&self) -> XrayResult<RealityKeyPair> {
        let binary = &self.settings.paths.binary;
        let output = Command::new(binary)
            .arg("x25519")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| XrayError::io(format!("failed to run {} x25519", binary.display()), e))?;

        if !output.status.success() {
            return Err(XrayError::KeyPairCommand(output.status));
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        parse_key_pair(&text)
    }

    /// Stop xray, run `install` against the binary paths, then force a restart.
    ///
    /// The restart is attempted even when `install` fails so a half-finished
    /// update does not leave the proxy down; the install error is still
    /// returned in that case.
    pub async fn replace_binary<F, Fut>(&self, install: F) -> anyhow::Result<()>
    where
        F: FnOnce(XrayPaths) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let previous = self.running_process();
        match self.stop_xray().await {
            Ok(()) | Err(XrayError::NotRunning) => {}
            Err(e) => warn!(error = %e, "Failed to stop xray before replacing binary"),
        }
        if let Some(process) = previous {
            wait_for_exit(&process, EXIT_WAIT_TIMEOUT).await;
        }

        let installed = install(self.settings.paths.clone()).await;
        if let Err(e) = &installed {
            warn!(error = %e, "Installing xray binary failed");
        }

        let restarted = self.restart_xray(true).await;
        installed?;
        restarted?;
        info!(version = %self.get_xray_version(), "Xray binary replaced");
        Ok(())
    }

    /// Stop the live process and wait for it to be reaped
    pub async fn shutdown(&self) {
        let _guard = self.restart_lock.lock().await;
        let Some(process) = self.running_process() else {
            return;
        };
        info!(pid = process.pid(), "Stopping xray for shutdown");
        if let Err(e) = process.stop() {
            warn!(error = %e, "Failed to stop xray during shutdown");
        }
        if !wait_for_exit(&process, EXIT_WAIT_TIMEOUT).await {
            warn!(pid = process.pid(), "Xray did not exit before shutdown timeout");
        }
    }
}

/// Poll until the process has been reaped; false on timeout
async fn wait_for_exit(process: &ManagedProcess, timeout: Duration) -> bool {
    let start = Instant::now();
    while process.is_running() {
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

/// Find the "Private key:" and "Public key:" lines; both must be present
pub fn parse_key_pair(output: &str) -> XrayResult<RealityKeyPair> {
    let mut private_key = None;
    let mut public_key = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Private key:") {
            private_key = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Public key:") {
            public_key = Some(value.trim().to_string());
        }
    }

    match (private_key, public_key) {
        (Some(private_key), Some(public_key))
            if !private_key.is_empty() && !public_key.is_empty() =>
        {
            Ok(RealityKeyPair {
                private_key,
                public_key,
            })
        }
        _ => Err(XrayError::KeyPairParse),
    }
}
