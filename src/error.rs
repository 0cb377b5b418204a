use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::proxy::cache::CacheError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum EdgeProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Failed to connect to origin: {0}")]
    OriginUnreachable(String),

    #[error("Origin timed out: {0}")]
    OriginTimeout(String),

    #[error("Cache store error: {0}")]
    Cache(#[from] CacheError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EdgeProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeProxyError::OriginUnreachable(_) => StatusCode::BAD_GATEWAY,
            EdgeProxyError::OriginTimeout(_) => StatusCode::BAD_GATEWAY,
            EdgeProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EdgeProxyError::Json(_) => StatusCode::BAD_REQUEST,
            EdgeProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeProxyError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EdgeProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            EdgeProxyError::OriginUnreachable(_) => "ORIGIN_UNREACHABLE",
            EdgeProxyError::OriginTimeout(_) => "ORIGIN_TIMEOUT",
            EdgeProxyError::BadRequest(_) => "BAD_REQUEST",
            EdgeProxyError::Json(_) => "JSON_ERROR",
            EdgeProxyError::Config(_) => "CONFIG_ERROR",
            EdgeProxyError::Cache(_) => "CACHE_ERROR",
            EdgeProxyError::Internal(_) => "INTERNAL_ERROR",
            EdgeProxyError::Io(_) => "IO_ERROR",
        }
    }

    /// Origin connectivity failures are the only errors clients ever see.
    pub fn is_origin_failure(&self) -> bool {
        matches!(
            self,
            EdgeProxyError::OriginUnreachable(_) | EdgeProxyError::OriginTimeout(_)
        )
    }
}

impl IntoResponse for EdgeProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // The body for origin failures is a fixed contract with clients.
        let body = if self.is_origin_failure() {
            Json(json!({
                "error": "Proxy error",
                "message": "Failed to connect to backend"
            }))
        } else {
            Json(json!({
                "error": {
                    "code": self.error_code(),
                    "message": self.to_string(),
                    "status": status.as_u16()
                }
            }))
        };

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}

pub type Result<T> = std::result::Result<T, EdgeProxyError>;
