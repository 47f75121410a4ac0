use crate::error::{XrayError, XrayResult};
use crate::stats::StatsQuery;
use crate::traffic::{merge_stats, Traffic, TrafficCache};
use crate::xray_config::XrayConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Number of stdout/stderr lines retained per process
pub const LOG_CAPACITY: usize = 100;

/// Version reported when the binary cannot be probed
pub const UNKNOWN_VERSION: &str = "Unknown";

/// Upper bound for `xray -version`
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longer output lines are split into chunks of this size
pub const MAX_LOG_LINE: usize = 8192;

/// Locations of the managed binary and the config file it reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrayPaths {
    pub binary: PathBuf,
    pub config: PathBuf,
}

impl XrayPaths {
    /// Conventional layout: `<dir>/xray-<os>-<arch>` and `<dir>/config.json`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            binary: dir.join(binary_name()),
            config: dir.join("config.json"),
        }
    }
}

/// Platform-specific binary name, using Go's os/arch spelling
pub fn binary_name() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("xray-{}-{}", std::env::consts::OS, arch)
}

/// Bounded FIFO of captured output lines; the oldest line is evicted first
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// How the process ended, recorded once by the waiter task
#[derive(Debug, Clone)]
struct ExitRecord {
    code: Option<i32>,
    error: Option<String>,
}

/// One instance of the Xray subprocess.
///
/// A `ManagedProcess` is created for a specific config and started at most
/// once; the supervisor replaces the whole instance on every restart. It is
/// always handled through an `Arc`: the log readers and the exit waiter hold
/// clones while the process runs.
///
/// Liveness is derived from the handle: the process is running once a pid
/// has been assigned and until the waiter has recorded an exit.
pub struct ManagedProcess {
    config: Arc<XrayConfig>,
    paths: XrayPaths,
    stats: Arc<dyn StatsQuery>,
    traffic_cache: TrafficCache,
    logs: LogBuffer,
    pid: OnceLock<u32>,
    exit: OnceLock<ExitRecord>,
    start_error: OnceLock<String>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    version: RwLock<String>,
    api_port: AtomicU16,
}

impl ManagedProcess {
    pub fn new(
        config: Arc<XrayConfig>,
        paths: XrayPaths,
        stats: Arc<dyn StatsQuery>,
        traffic_cache_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            paths,
            stats,
            traffic_cache: TrafficCache::new(traffic_cache_ttl),
            logs: LogBuffer::new(LOG_CAPACITY),
            pid: OnceLock::new(),
            exit: OnceLock::new(),
            start_error: OnceLock::new(),
            kill_tx: Mutex::new(None),
            version: RwLock::new(UNKNOWN_VERSION.to_string()),
            api_port: AtomicU16::new(0),
        })
    }

    pub fn is_running(&self) -> bool {
        self.pid.get().is_some() && self.exit.get().is_none()
    }

    /// The config this instance was (or will be) started with
    pub fn config(&self) -> &Arc<XrayConfig> {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn api_port(&self) -> u16 {
        self.api_port.load(Ordering::SeqCst)
    }

    pub fn traffic_cache(&self) -> &TrafficCache {
        &self.traffic_cache
    }

    /// Exit code once the process has ended on its own or been killed
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get().and_then(|record| record.code)
    }

    /// Sticky failure: an unrequested crash, or the reason start failed
    pub fn error(&self) -> Option<String> {
        self.exit
            .get()
            .and_then(|record| record.error.clone())
            .or_else(|| self.start_error.get().cloned())
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.logs.lines()
    }

    /// Captured output joined by newlines, or the error when nothing was captured
    pub fn result(&self) -> String {
        if self.logs.is_empty() {
            if let Some(err) = self.error() {
                return err;
            }
        }
        self.logs.lines().join("\n")
    }

    /// Write the config, launch the binary and attach log readers and the exit waiter
    pub async fn start(self: &Arc<Self>) -> XrayResult<()> {
        if self.is_running() {
            return Err(XrayError::AlreadyRunning);
        }

        if let Err(e) = self.launch().await {
            let _ = self.start_error.set(e.to_string());
            return Err(e);
        }

        self.refresh_version().await;
        self.api_port.store(self.config.api_port(), Ordering::SeqCst);

        info!(
            pid = self.pid(),
            version = %self.version(),
            api_port = self.api_port(),
            "Xray started"
        );
        Ok(())
    }

    async fn launch(self: &Arc<Self>) -> XrayResult<()> {
        let data = self
            .config
            .to_pretty_json()
            .map_err(|e| XrayError::io("failed to generate xray config", e.into()))?;

        if let Some(parent) = self.paths.config.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| XrayError::io("failed to create xray config directory", e))?;
            }
        }
        tokio::fs::write(&self.paths.config, data)
            .await
            .map_err(|e| XrayError::io("failed to write xray config file", e))?;

        let mut cmd = Command::new(&self.paths.binary);
        cmd.arg("-c").arg(&self.paths.config);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            XrayError::io(
                format!("failed to spawn {}", self.paths.binary.display()),
                e,
            )
        })?;

        let pid = child.id().unwrap_or(0);
        let _ = self.pid.set(pid);
        debug!(pid, binary = %self.paths.binary.display(), "Xray process spawned");

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_reader(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_reader(stderr, "stderr");
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock() = Some(kill_tx);
        self.spawn_waiter(child, kill_rx);

        Ok(())
    }

    fn spawn_log_reader<R>(self: &Arc<Self>, stream: R, name: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = BufReader::with_capacity(MAX_LOG_LINE, stream);
            let mut buf = Vec::with_capacity(MAX_LOG_LINE);
            loop {
                buf.clear();
                let mut line_reader = (&mut reader).take(MAX_LOG_LINE as u64);
                match line_reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
                        debug!(target: "xray", stream = name, "{}", line);
                        process.logs.push(line.to_string());
                    }
                    Err(e) => {
                        debug!(stream = name, error = %e, "Xray log stream closed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_waiter(self: &Arc<Self>, mut child: Child, kill_rx: oneshot::Receiver<()>) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let (result, requested) = tokio::select! {
                status = child.wait() => (status, false),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to kill xray");
                    }
                    (child.wait().await, true)
                }
            };

            let record = match result {
                Ok(status) if requested || status.success() => ExitRecord {
                    code: status.code(),
                    error: None,
                },
                Ok(status) => ExitRecord {
                    code: status.code(),
                    error: Some(format!("xray exited unexpectedly: {}", status)),
                },
                Err(e) => ExitRecord {
                    code: None,
                    error: Some(format!("failed to wait for xray: {}", e)),
                },
            };

            match &record.error {
                Some(err) => warn!(pid = process.pid(), error = %err, "Xray process exited"),
                None => info!(pid = process.pid(), code = ?record.code, "Xray process exited"),
            }
            let _ = process.exit.set(record);
        });
    }

    async fn refresh_version(&self) {
        let version = probe_version(&self.paths.binary).await;
        *self.version.write() = version;
    }

    /// Kill the process without waiting for it to exit
    pub fn stop(&self) -> XrayResult<()> {
        if !self.is_running() {
            return Err(XrayError::NotRunning);
        }
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            info!(pid = self.pid(), "Killing xray process");
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    /// Per-tag counters, from the cache when fresh unless `reset` is set
    pub async fn get_traffic(&self, reset: bool) -> XrayResult<Vec<Traffic>> {
        if !reset {
            if let Some(traffics) = self.traffic_cache.get() {
                return Ok(traffics);
            }
        }

        let port = self.api_port();
        if port == 0 {
            return Err(XrayError::ApiPortUnset);
        }

        let stats = self.stats.query_stats(port, reset).await?;
        let traffics = merge_stats(&stats);

        if !reset {
            self.traffic_cache.set(traffics.clone());
        }
        Ok(traffics)
    }
}

/// Run `<binary> -version` and take the second word of its output
pub async fn probe_version(binary: &Path) -> String {
    let mut cmd = Command::new(binary);
    cmd.arg("-version");
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            parse_version(&String::from_utf8_lossy(&output.stdout))
                .unwrap_or(UNKNOWN_VERSION)
                .to_string()
        }
        Ok(Ok(output)) => {
            debug!(status = %output.status, "Xray version probe failed");
            UNKNOWN_VERSION.to_string()
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Xray version probe failed");
            UNKNOWN_VERSION.to_string()
        }
        Err(_) => {
            debug!("Xray version probe timed out");
            UNKNOWN_VERSION.to_string()
        }
    }
}

fn parse_version(output: &str) -> Option<&str> {
    output.split_whitespace().nth(1)
}
