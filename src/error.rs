//! Error types and JSON error responses for both planes.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Canonical body type for everything the proxy writes or forwards.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Build a boxed body from raw bytes.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty boxed body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Errors surfaced by control-plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidEncoding(String),
    #[error("authorization failed")]
    Unauthorized,
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::AlreadyExists(_) => StatusCode::CONFLICT,
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::InvalidEncoding(_) => StatusCode::BAD_REQUEST,
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Control-plane error body, `{"error": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Render a control-plane error as a JSON response.
pub fn control_error_response(err: &ControlError) -> Response<ProxyBody> {
    let body = serde_json::to_string(&ErrorBody {
        error: err.to_string(),
    })
    .unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, err.status_code()));

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Error codes attached to data-plane responses the proxy generates itself.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or invalid Host header in request
    MissingHostHeader,
    /// No pool registered for the requested host
    UnknownHost,
    /// The pool has no healthy server to take the request
    NoHealthyServer,
    /// The upstream server could not be reached
    UpstreamUnreachable,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoHealthyServer => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error code string carried in the X-Proxy-Error header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::NoHealthyServer => "NO_HEALTHY_SERVER",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
        }
    }
}

/// JSON error response body for the data plane.
#[derive(Debug, Serialize)]
pub struct ProxyErrorBody {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

/// Create a data-plane JSON error response with an X-Proxy-Error header.
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let status = code.status_code();
    let body = ProxyErrorBody {
        code,
        message: message.into(),
        status: status.as_u16(),
    };
    let body = serde_json::to_string(&body).unwrap_or_else(|_| {
        format!(
            r#"{{"code":"{}","status":{}}}"#,
            code.as_header_value(),
            status.as_u16()
        )
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
