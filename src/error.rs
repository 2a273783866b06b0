//! Error taxonomy for the conductor, and its mapping onto HTTP responses.

use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::prelude::*;

/// Our result alias.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Errors produced by the conductor's scheduling, rate-accounting and
/// dispatch engine.
///
/// Each variant corresponds to a row in the error-handling design: it knows
/// how to render itself as the HTTP response a client should see.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// No enabled provider/key exists to serve any request.
    #[error("No providers configured. Add API keys to config/config.yaml")]
    NoProviders,

    /// RESERVE waited past `request_timeout` without acquiring capacity.
    #[error("Request timed out waiting for available capacity")]
    CapacityTimeout,

    /// A provider returned a non-429 4xx. Retrying elsewhere will not help.
    #[error("{message}")]
    UpstreamClient { status: StatusCode, message: String },

    /// All rotations were exhausted against 5xx / network errors.
    #[error("{0}")]
    UpstreamServer(String),

    /// The inbound request body failed validation.
    #[error("{0}")]
    BadRequest(String),

    /// Startup configuration was invalid (distinct from "no providers",
    /// which is allowed to start and answer with 503).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IntoResponse for ConductorError {
    fn into_response(self) -> axum::response::Response {
        let (status, detail) = match &self {
            ConductorError::NoProviders => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ConductorError::CapacityTimeout => {
                (StatusCode::GATEWAY_TIMEOUT, self.to_string())
            }
            ConductorError::UpstreamClient { status, message } => {
                (*status, message.clone())
            }
            ConductorError::UpstreamServer(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
            ConductorError::BadRequest(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            ConductorError::Config(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
