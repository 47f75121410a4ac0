//! Admin API served over a real socket

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use xpanel::admin::{AdminServer, AdminState};
use xpanel::config_builder::{ConfigBuilder, DEFAULT_CONFIG_CACHE_TTL};
use xpanel::process::XrayPaths;
use xpanel::stats::GrpcStatsClient;
use xpanel::store::{FileStore, InboundStore, SettingStore};
use xpanel::supervisor::{Supervisor, SupervisorSettings};

const TOKEN: &str = "admin-secret";

/// Send a request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    token: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port, auth
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn start_server(dir: &std::path::Path) -> (u16, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    std::fs::write(dir.join("template.json"), r#"{"inbounds": []}"#).unwrap();
    std::fs::write(
        dir.join("inbounds.json"),
        r#"[{"id": 7, "port": 4433, "protocol": "trojan", "tag": "inbound-4433"}]"#,
    )
    .unwrap();

    let store = Arc::new(FileStore::new(
        dir.join("template.json"),
        dir.join("inbounds.json"),
    ));
    let settings: Arc<dyn SettingStore> = store.clone();
    let inbounds: Arc<dyn InboundStore> = store;
    let supervisor = Supervisor::new(
        ConfigBuilder::new(settings, Arc::clone(&inbounds), DEFAULT_CONFIG_CACHE_TTL),
        Arc::new(GrpcStatsClient::default()),
        SupervisorSettings {
            paths: XrayPaths::in_dir(dir.join("bin")),
            traffic_cache_ttl: Duration::from_secs(2),
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = AdminServer::new(
        listener.local_addr().unwrap(),
        AdminState::new(supervisor, inbounds, TOKEN.to_string()),
        shutdown_rx,
    );
    assert_eq!(server.auth_token(), TOKEN);

    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, shutdown_tx, handle)
}

#[tokio::test]
async fn test_admin_api_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let (port, shutdown_tx, handle) = start_server(dir.path()).await;

    let resp = http_request(port, "GET", "/health", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));

    let resp = http_request(port, "POST", "/xray/status", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 401"));
    assert!(resp.to_lowercase().contains("x-panel-error: unauthorized"));

    let resp = http_request(port, "POST", "/xray/status", Some(TOKEN)).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains(r#""state":"stop""#));

    let resp = http_request(port, "GET", "/xray/config", Some(TOKEN)).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains("inbound-4433"));

    let resp = http_request(port, "GET", "/inbounds", Some(TOKEN)).await.unwrap();
    assert!(resp.contains(r#""count":1"#));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
