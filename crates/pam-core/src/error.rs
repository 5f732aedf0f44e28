//! Error types shared by every PAM subsystem.

use thiserror::Error;

/// Result type alias for PAM operations
pub type PamResult<T> = Result<T, PamError>;

/// Errors surfaced by the core; the gateway maps each variant to an HTTP status.
#[derive(Error, Debug)]
pub enum PamError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Rate limit exceeded: {limit} requests per minute. Retry in {retry_after_secs}s")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PamError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PamError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        PamError::NotFound(what.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        PamError::Unauthorized(msg.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            PamError::Validation(_) => 400,
            PamError::Unauthorized(_) => 401,
            PamError::Forbidden(_) => 403,
            PamError::NotFound(_) => 404,
            PamError::RateLimited { .. } => 429,
            PamError::Database(_) | PamError::Internal(_) => 500,
            PamError::ServiceUnavailable(_) => 503,
        }
    }
}

impl From<sled::Error> for PamError {
    fn from(err: sled::Error) -> Self {
        PamError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PamError {
    fn from(err: serde_json::Error) -> Self {
        PamError::Database(format!("record encoding: {}", err))
    }
}

impl From<config::ConfigError> for PamError {
    fn from(err: config::ConfigError) -> Self {
        PamError::Internal(format!("configuration: {}", err))
    }
}
