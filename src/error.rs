use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why an upstream fetch failed, without the underlying error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    Dns,
    Connect,
    Tls,
    Timeout,
    Body,
    Request,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UpstreamFailure::Dns => "host could not be resolved",
            UpstreamFailure::Connect => "connection failed",
            UpstreamFailure::Tls => "TLS handshake failed",
            UpstreamFailure::Timeout => "request timed out",
            UpstreamFailure::Body => "response body could not be read",
            UpstreamFailure::Request => "request could not be sent",
        };
        f.write_str(text)
    }
}

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("URL parameter is required")]
    MissingUrl,

    #[error("Invalid URL: {reason}")]
    InvalidUrl { reason: String },

    #[error("Access denied")]
    Blocked,

    #[error("Failed to fetch {host}: {failure}")]
    Upstream { host: String, failure: UpstreamFailure },

    #[error("Failed to decode {encoding} body: {reason}")]
    Decode { encoding: String, reason: String },

    #[error("Redirect to foreign origin {origin} is not allowed")]
    ForeignRedirect { origin: String },

    #[error("WebSocket upgrades are not proxied")]
    UpgradeNotSupported,

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingUrl => StatusCode::BAD_REQUEST,
            ProxyError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Json(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpgradeNotSupported => StatusCode::BAD_REQUEST,
            ProxyError::Blocked => StatusCode::FORBIDDEN,
            ProxyError::ForeignRedirect { .. } => StatusCode::FORBIDDEN,
            ProxyError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Decode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::MissingUrl => "MISSING_URL",
            ProxyError::InvalidUrl { .. } => "INVALID_URL",
            ProxyError::Json(_) => "INVALID_BODY",
            ProxyError::UpgradeNotSupported => "UPGRADE_NOT_SUPPORTED",
            ProxyError::Blocked => "BLOCKED",
            ProxyError::ForeignRedirect { .. } => "FOREIGN_REDIRECT",
            ProxyError::Upstream { .. } => "UPSTREAM_ERROR",
            ProxyError::Decode { .. } => "DECODE_ERROR",
            ProxyError::Internal(_) => "INTERNAL_ERROR",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }

    /// Message safe to show to a visitor. Internal faults never expose
    /// their details.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Internal(_) | ProxyError::Io(_) => {
                "Internal server error".to_string()
            }
            ProxyError::Decode { .. } => "Upstream content could not be decoded".to_string(),
            ProxyError::Json(_) => "Request body must be a JSON object".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "message": self.public_message(),
            "error": self.error_code(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
