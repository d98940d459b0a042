//! Error type shared across the crate.

/// Errors raised by handlers and background logic.
///
/// The HTTP layer maps `BadRequest` to 400, `Unauthorized` to 401, `NotFound`
/// to 404 and everything else to 500. Background loops log and continue.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// Client sent a request we cannot process
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Request authentication failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The requested resource does not exist
    #[error("not found")]
    NotFound,
    /// Database error
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    /// Outbound HTTP request failed
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// JSON (de)serialization failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Anything else that should surface as an internal error
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Wraps any displayable error as an internal error.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        AppError::Internal(err.to_string())
    }
}
