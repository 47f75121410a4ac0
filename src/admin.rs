//! Admin API for controlling the managed Xray process

use crate::error::{json_error_response, ErrorCode, XrayError};
use crate::store::InboundStore;
use crate::supervisor::Supervisor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the panel
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ErrorCode::ConfigError, e.to_string()),
    }
}

fn xray_error(err: &XrayError) -> Response<Full<Bytes>> {
    warn!(error = %err, "Admin API xray operation failed");
    err.into()
}

/// Shared state behind every admin connection
#[derive(Clone)]
pub struct AdminState {
    supervisor: Arc<Supervisor>,
    inbounds: Arc<dyn InboundStore>,
    auth_token: Arc<String>,
}

impl AdminState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        inbounds: Arc<dyn InboundStore>,
        auth_token: String,
    ) -> Self {
        Self {
            supervisor,
            inbounds,
            auth_token: Arc::new(auth_token),
        }
    }
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = state.clone();
        async move {
            let resp = handle_admin_request(&state, req.method(), req.uri(), req.headers()).await;
            Ok::<_, hyper::Error>(resp)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// True when the query string carries `force=true` or `force=1`
fn force_requested(query: Option<&str>) -> bool {
    query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "force" && (value == "true" || value == "1"))
}

pub async fn handle_admin_request(
    state: &AdminState,
    method: &Method,
    uri: &hyper::Uri,
    headers: &HeaderMap,
) -> Response<Full<Bytes>> {
    let path = uri.path();
    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => return response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version_info.to_string());
        }
        _ => {}
    }

    if !check_auth(headers, &state.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return json_error_response(ErrorCode::Unauthorized, "unauthorized");
    }

    let supervisor = &state.supervisor;
    match (method, path) {
        (&Method::POST, "/xray/status") => json_ok(&supervisor.status()),

        (&Method::POST, "/xray/restart") => {
            let force = force_requested(uri.query());
            match supervisor.restart_xray(force).await {
                Ok(replaced) => {
                    info!(force, replaced, "Xray restart requested via admin API");
                    json_ok(&supervisor.status())
                }
                Err(e) => xray_error(&e),
            }
        }

        (&Method::POST, "/xray/stop") => match supervisor.stop_xray().await {
            Ok(()) => {
                info!("Xray stopped via admin API");
                json_ok(&serde_json::json!({"stopped": true}))
            }
            Err(e) => xray_error(&e),
        },

        (&Method::GET, "/xray/config") => match supervisor.get_xray_config() {
            Ok(config) => json_ok(config.as_ref()),
            Err(e) => xray_error(&e),
        },

        (&Method::GET, "/xray/traffic") => match supervisor.get_traffic(false).await {
            Ok(traffics) => json_ok(&traffics),
            Err(e) => xray_error(&e),
        },

        (&Method::POST, "/xray/generateRealityKeyPair") => {
            match supervisor.generate_reality_key_pair().await {
                Ok(pair) => json_ok(&pair),
                Err(e) => xray_error(&e),
            }
        }

        (&Method::GET, "/inbounds") => match state.inbounds.all_inbounds() {
            Ok(inbounds) => {
                let body = serde_json::json!({
                    "count": inbounds.len(),
                    "inbounds": inbounds,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => json_error_response(ErrorCode::ConfigError, format!("{:#}", e)),
        },

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}
