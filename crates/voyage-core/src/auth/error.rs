use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication, credential persistence and authenticated requests.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("no valid credential available")]
    Unauthenticated,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("request rejected with 401: {body}")]
    Unauthorized { body: String },
    #[error("token refresh rejected ({status}): {body}")]
    RefreshRejected { status: StatusCode, body: String },
    #[error("token refresh did not complete in time")]
    RefreshTimeout,
    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("token lifetime of {0} seconds is out of range")]
    InvalidExpiry(i64),
    #[error("persisted credential data is corrupt: {0}")]
    CorruptStore(String),
}

impl AuthError {
    /// Whether the failure came from the network rather than from the server's answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, AuthError::Http(_))
    }

    /// Message suitable for showing to an end user, distinct per cause.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "Incorrect email or password.",
            AuthError::Validation(_) => "Invalid data. Check the submitted information.",
            AuthError::Http(_) => "Unable to reach the server. Check your connection.",
            AuthError::Unauthenticated
            | AuthError::Unauthorized { .. }
            | AuthError::RefreshRejected { .. }
            | AuthError::RefreshTimeout => "Your session has expired. Please log in again.",
            _ => "Something went wrong. Please try again.",
        }
    }
}
