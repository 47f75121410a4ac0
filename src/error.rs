//! Error taxonomy for the Xray core and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by the process supervisor and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum XrayError {
    /// Stop or traffic fetch attempted with no live process
    #[error("xray is not running")]
    NotRunning,

    /// Start attempted while a process is live
    #[error("xray is already running")]
    AlreadyRunning,

    /// Config serialization, file write, spawn or probe failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The running config declares no inbound tagged "api"
    #[error("xray api port is not set")]
    ApiPortUnset,

    /// Dialing the stats endpoint failed
    #[error("failed to connect to xray stats api: {0}")]
    RpcConnect(#[from] tonic::transport::Error),

    /// Dial plus call exceeded the RPC deadline
    #[error("xray stats api timed out after {0:?}")]
    RpcTimeout(std::time::Duration),

    /// The stats call itself returned an error status
    #[error("xray stats query failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The key pair generator printed something unexpected
    #[error("failed to parse reality key pair from xray output")]
    KeyPairParse,

    /// The key pair generator exited unsuccessfully
    #[error("xray x25519 exited with {0}")]
    KeyPairCommand(std::process::ExitStatus),

    /// The stored config template is not a valid document
    #[error("invalid xray config template: {0}")]
    Template(#[source] serde_json::Error),

    /// A settings or inbound collaborator failed
    #[error("{0:#}")]
    Store(anyhow::Error),
}

impl XrayError {
    /// Wrap an I/O error with a short description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        XrayError::Io {
            context: context.into(),
            source,
        }
    }

    /// Error code used when reporting this error over the admin API
    pub fn code(&self) -> ErrorCode {
        match self {
            XrayError::NotRunning => ErrorCode::NotRunning,
            XrayError::AlreadyRunning => ErrorCode::AlreadyRunning,
            XrayError::Io { .. } => ErrorCode::IoFailure,
            XrayError::ApiPortUnset
            | XrayError::RpcConnect(_)
            | XrayError::RpcTimeout(_)
            | XrayError::Rpc(_) => ErrorCode::StatsUnavailable,
            XrayError::KeyPairParse | XrayError::KeyPairCommand(_) => ErrorCode::KeyPairFailed,
            XrayError::Template(_) | XrayError::Store(_) => ErrorCode::ConfigError,
        }
    }
}

pub type XrayResult<T> = Result<T, XrayError>;

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No xray process is live
    NotRunning,
    /// An xray process is already live
    AlreadyRunning,
    /// Config write, spawn or probe failure
    IoFailure,
    /// Traffic statistics could not be fetched
    StatsUnavailable,
    /// Reality key pair generation failed
    KeyPairFailed,
    /// Config template or inbound store failure
    ConfigError,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route
    NotFound,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotRunning => StatusCode::CONFLICT,
            ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StatsUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::KeyPairFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Panel-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::IoFailure => "IO_FAILURE",
            ErrorCode::StatsUnavailable => "STATS_UNAVAILABLE",
            ErrorCode::KeyPairFailed => "KEY_PAIR_FAILED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Panel-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Panel-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&XrayError> for Response<Full<Bytes>> {
    fn from(err: &XrayError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
