use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use xpanel::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use xpanel::config::Config;
use xpanel::config_builder::ConfigBuilder;
use xpanel::jobs::{run_periodic, InboundEnforcementJob, ReconciliationJob, TrafficPollJob};
use xpanel::stats::GrpcStatsClient;
use xpanel::store::{FileStore, InboundStore, SettingStore};
use xpanel::supervisor::{Supervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xpanel=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("xpanel.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(FileStore::new(
        &config.store.template_path,
        &config.store.inbounds_path,
    ));
    let settings: Arc<dyn SettingStore> = store.clone();
    let inbounds: Arc<dyn InboundStore> = store;

    let supervisor = Supervisor::new(
        ConfigBuilder::new(
            settings,
            Arc::clone(&inbounds),
            config.xray.config_cache_ttl(),
        ),
        Arc::new(GrpcStatsClient::new(config.xray.rpc_timeout())),
        SupervisorSettings {
            paths: config.xray.paths(),
            traffic_cache_ttl: config.xray.traffic_cache_ttl(),
        },
    );

    if config.xray.start_on_launch {
        match supervisor.restart_xray(false).await {
            Ok(_) => info!(version = %supervisor.get_xray_version(), "Xray started"),
            Err(e) => warn!(error = %e, "Failed to start xray, will retry on next reconciliation"),
        }
    }

    // Spawn periodic jobs
    let reconcile = Arc::new(ReconciliationJob::new(
        Arc::clone(&supervisor),
        config.jobs.min_restart_interval(),
    ));
    let reconcile_handle = tokio::spawn(run_periodic(
        "reconcile",
        config.jobs.reconcile_interval(),
        shutdown_rx.clone(),
        move || {
            let job = Arc::clone(&reconcile);
            async move {
                job.run_once().await;
            }
        },
    ));

    let traffic = Arc::new(TrafficPollJob::new(
        Arc::clone(&supervisor),
        Arc::clone(&inbounds),
    ));
    let traffic_handle = tokio::spawn(run_periodic(
        "traffic",
        config.jobs.traffic_interval(),
        shutdown_rx.clone(),
        move || {
            let job = Arc::clone(&traffic);
            async move {
                job.run_once().await;
            }
        },
    ));

    let enforcement = Arc::new(InboundEnforcementJob::new(
        Arc::clone(&supervisor),
        Arc::clone(&inbounds),
    ));
    let enforcement_handle = tokio::spawn(run_periodic(
        "enforcement",
        config.jobs.enforcement_interval(),
        shutdown_rx.clone(),
        move || {
            let job = Arc::clone(&enforcement);
            async move {
                job.run_once();
            }
        },
    ));

    // Create admin server
    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        AdminState::new(Arc::clone(&supervisor), inbounds, admin_token),
        shutdown_rx.clone(),
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or forced restart (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rebuilding config and restarting xray...");
                    supervisor.invalidate_cache();
                    match supervisor.restart_xray(true).await {
                        Ok(_) => info!(version = %supervisor.get_xray_version(), "Xray restarted"),
                        Err(e) => error!(error = %e, "Failed to restart xray"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping xray...");
    supervisor.shutdown().await;

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = reconcile_handle.await;
        let _ = traffic_handle.await;
        let _ = enforcement_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting xray panel");
    let paths = config.xray.paths();
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Admin API configuration"
    );
    info!(
        binary = %paths.binary.display(),
        config = %paths.config.display(),
        start_on_launch = config.xray.start_on_launch,
        "Xray paths"
    );
    info!(
        config_cache_ttl_secs = config.xray.config_cache_ttl_secs,
        traffic_cache_ttl_ms = config.xray.traffic_cache_ttl_ms,
        rpc_timeout_secs = config.xray.rpc_timeout_secs,
        "Cache settings"
    );
    info!(
        reconcile_interval_secs = config.jobs.reconcile_interval_secs,
        min_restart_interval_secs = config.jobs.min_restart_interval_secs,
        traffic_interval_secs = config.jobs.traffic_interval_secs,
        enforcement_interval_secs = config.jobs.enforcement_interval_secs,
        "Job schedule"
    );
    info!(
        template = %config.store.template_path,
        inbounds = %config.store.inbounds_path,
        "Store files"
    );
}
