//! Periodic jobs driving the supervisor
//!
//! Each job exposes a `run_once` step so the scheduling loop stays trivial and
//! the decision logic can be tested without timers.

use crate::store::InboundStore;
use crate::supervisor::Supervisor;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use crate::supervisor::ReconcileOutcome;

/// Applies restart requests, at most once per interval
///
/// The interval and the time of the last restart are kept by the supervisor,
/// so every job driving the same supervisor shares one limit.
pub struct ReconciliationJob {
    supervisor: Arc<Supervisor>,
    min_restart_interval: Duration,
}

impl ReconciliationJob {
    pub fn new(supervisor: Arc<Supervisor>, min_restart_interval: Duration) -> Self {
        Self {
            supervisor,
            min_restart_interval,
        }
    }

    pub async fn run_once(&self) -> ReconcileOutcome {
        let outcome = self.supervisor.reconcile(self.min_restart_interval).await;
        match outcome {
            ReconcileOutcome::Idle | ReconcileOutcome::Deferred => {}
            ReconcileOutcome::Unchanged => info!("Xray restart requested, config unchanged"),
            ReconcileOutcome::Restarted => info!("Xray restarted by reconciliation"),
            ReconcileOutcome::Failed => warn!("Xray reconciliation restart failed"),
        }
        outcome
    }
}

/// Moves traffic deltas from the stats API into the inbound store
pub struct TrafficPollJob {
    supervisor: Arc<Supervisor>,
    inbounds: Arc<dyn InboundStore>,
}

impl TrafficPollJob {
    pub fn new(supervisor: Arc<Supervisor>, inbounds: Arc<dyn InboundStore>) -> Self {
        Self {
            supervisor,
            inbounds,
        }
    }

    /// Returns the number of tags recorded
    pub async fn run_once(&self) -> usize {
        if !self.supervisor.is_xray_running() {
            return 0;
        }
        let traffics = match self.supervisor.get_traffic(true).await {
            Ok(traffics) => traffics,
            Err(e) => {
                warn!(error = %e, "Failed to get xray traffic");
                return 0;
            }
        };
        if let Err(e) = self.inbounds.add_traffic(&traffics) {
            warn!(error = %e, "Failed to record xray traffic");
            return 0;
        }
        debug!(tags = traffics.len(), "Recorded xray traffic");
        traffics.len()
    }
}

/// Disables expired and exhausted inbounds and requests a restart when it did
pub struct InboundEnforcementJob {
    supervisor: Arc<Supervisor>,
    inbounds: Arc<dyn InboundStore>,
}

impl InboundEnforcementJob {
    pub fn new(supervisor: Arc<Supervisor>, inbounds: Arc<dyn InboundStore>) -> Self {
        Self {
            supervisor,
            inbounds,
        }
    }

    /// Returns the number of inbounds disabled
    pub fn run_once(&self) -> usize {
        let mut disabled = 0;

        match self.inbounds.disable_invalid_inbounds() {
            Ok(count) => {
                if count > 0 {
                    info!(count, "Disabled expired inbounds");
                }
                disabled += count;
            }
            Err(e) => warn!(error = %e, "Failed to disable expired inbounds"),
        }

        match self.inbounds.disable_exhausted_inbounds() {
            Ok(count) => {
                if count > 0 {
                    info!(count, "Disabled inbounds over their traffic quota");
                }
                disabled += count;
            }
            Err(e) => warn!(error = %e, "Failed to disable exhausted inbounds"),
        }

        if disabled > 0 {
            self.supervisor.set_to_need_restart();
        }
        disabled
    }
}

/// Run `step` every `interval` until the shutdown channel flips to true
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(job = name, interval_ms = interval.as_millis() as u64, "Job scheduled");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                step().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(job = name, "Job stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_builder::{ConfigBuilder, DEFAULT_CONFIG_CACHE_TTL};
    use crate::process::XrayPaths;
    use crate::stats::GrpcStatsClient;
    use crate::store::{FileStore, Inbound, SettingStore};
    use crate::supervisor::SupervisorSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn supervisor_with_store(dir: &std::path::Path, inbounds: &[Inbound]) -> (Arc<Supervisor>, Arc<FileStore>) {
        std::fs::write(dir.join("template.json"), r#"{"inbounds": []}"#).unwrap();
        std::fs::write(
            dir.join("inbounds.json"),
            serde_json::to_string(inbounds).unwrap(),
        )
        .unwrap();
        let store = Arc::new(FileStore::new(
            dir.join("template.json"),
            dir.join("inbounds.json"),
        ));
        let settings: Arc<dyn SettingStore> = store.clone();
        let inbound_store: Arc<dyn InboundStore> = store.clone();
        let supervisor = Supervisor::new(
            ConfigBuilder::new(settings, inbound_store, DEFAULT_CONFIG_CACHE_TTL),
            Arc::new(GrpcStatsClient::default()),
            SupervisorSettings {
                // No binary here: restarts fail fast, which is enough to observe attempts
                paths: XrayPaths::in_dir(dir.join("bin")),
                traffic_cache_ttl: Duration::from_secs(2),
            },
        );
        (supervisor, store)
    }

    #[tokio::test]
    async fn test_reconcile_idle_without_request() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with_store(dir.path(), &[]);
        let job = ReconciliationJob::new(supervisor, Duration::from_secs(300));

        assert_eq!(job.run_once().await, ReconcileOutcome::Idle);
    }

    #[tokio::test]
    async fn test_reconcile_defers_and_rearms_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with_store(dir.path(), &[]);
        let job = ReconciliationJob::new(Arc::clone(&supervisor), Duration::from_secs(300));

        supervisor.set_to_need_restart();
        // First attempt goes through (and fails: there is no binary)
        assert_eq!(job.run_once().await, ReconcileOutcome::Failed);
        assert!(!supervisor.is_need_restart_and_set_false());

        supervisor.set_to_need_restart();
        assert_eq!(job.run_once().await, ReconcileOutcome::Deferred);
        // The request survives the deferral
        assert_eq!(job.run_once().await, ReconcileOutcome::Deferred);
        assert!(supervisor.is_need_restart_and_set_false());
    }

    #[tokio::test]
    async fn test_reconcile_retries_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with_store(dir.path(), &[]);
        let job = ReconciliationJob::new(Arc::clone(&supervisor), Duration::from_millis(50));

        supervisor.set_to_need_restart();
        assert_eq!(job.run_once().await, ReconcileOutcome::Failed);

        supervisor.set_to_need_restart();
        assert_eq!(job.run_once().await, ReconcileOutcome::Deferred);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(job.run_once().await, ReconcileOutcome::Failed);
        assert_eq!(job.run_once().await, ReconcileOutcome::Idle);
    }

    #[tokio::test]
    async fn test_jobs_on_one_supervisor_share_restart_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, _) = supervisor_with_store(dir.path(), &[]);
        let first = ReconciliationJob::new(Arc::clone(&supervisor), Duration::from_secs(300));
        let second = ReconciliationJob::new(Arc::clone(&supervisor), Duration::from_secs(300));

        supervisor.set_to_need_restart();
        assert_eq!(first.run_once().await, ReconcileOutcome::Failed);

        supervisor.set_to_need_restart();
        assert_eq!(second.run_once().await, ReconcileOutcome::Deferred);
        assert!(supervisor.is_need_restart_and_set_false());
    }

    #[tokio::test]
    async fn test_enforcement_requests_restart_only_when_something_changed() {
        let dir = tempfile::tempdir().unwrap();
        let expired = Inbound {
            id: 1,
            enable: true,
            port: 1080,
            protocol: "vless".to_string(),
            tag: "old".to_string(),
            expiry_time: 1,
            ..Default::default()
        };
        let (supervisor, store) = supervisor_with_store(dir.path(), &[expired]);
        let job = InboundEnforcementJob::new(Arc::clone(&supervisor), store);

        assert_eq!(job.run_once(), 1);
        assert!(supervisor.is_need_restart_and_set_false());

        assert_eq!(job.run_once(), 0);
        assert!(!supervisor.is_need_restart_and_set_false());
    }

    #[tokio::test]
    async fn test_traffic_poll_skips_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let (supervisor, store) = supervisor_with_store(dir.path(), &[]);
        let job = TrafficPollJob::new(supervisor, store);

        assert_eq!(job.run_once().await, 0);
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_millis(10),
            shutdown_rx,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
