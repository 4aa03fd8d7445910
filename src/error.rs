//! Error types for the chat proxy
//!
//! Every variant maps to one HTTP status; upstream failures are passed
//! through with the upstream status code and body.

use actix_web::http::StatusCode;
use actix_web::http::header::{self, ContentType};
use actix_web::{HttpResponse, ResponseError};
use bytes::Bytes;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed client payload
    #[error("{0}")]
    InvalidRequest(String),
    /// Client exceeded its request quota for the current window
    #[error("Too many requests from this client, please try again later")]
    RateLimited { retry_after: Duration },
    /// Non-2xx reply from the upstream API
    #[error("Upstream returned status {status}")]
    Upstream { status: u16, body: Bytes },
    /// Network failure while reading the upstream stream
    #[error("Stream error: {0}")]
    Stream(String),
    /// Missing or invalid server-side configuration (e.g. API key)
    #[error("Server configuration error: {0}")]
    Config(String),
    /// Upstream could not be reached at all
    #[error("Failed to reach upstream: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::RateLimited { .. } => "rate_limited",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Stream(_) => "stream_error",
            ProxyError::Config(_) => "config_error",
            ProxyError::Transport(_) => "transport_error",
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Stream(_) | ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        match self {
            ProxyError::Upstream { body, .. } => builder
                .insert_header(ContentType::json())
                .body(body.clone()),
            ProxyError::RateLimited { retry_after } => builder
                .insert_header((header::RETRY_AFTER, retry_after.as_secs().max(1).to_string()))
                .json(self.to_json()),
            _ => builder.json(self.to_json()),
        }
    }
}

impl ProxyError {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}
