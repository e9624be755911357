//! Typed error taxonomy for the engine.
//!
//! Four families map one-to-one onto HTTP status codes and stable
//! machine-readable codes:
//!
//! | Variant | HTTP | `error_code` |
//! |---------|------|--------------|
//! | `Validation` | 400 | `VALIDATION_ERROR` |
//! | `BadRequest` | 400 | `BAD_REQUEST` |
//! | `Unauthorized` | 401 | `UNAUTHORIZED` |
//! | `NotFound` | 404 | `NOT_FOUND` |
//! | everything else | 500 | `INTERNAL_ERROR` |
//!
//! The core surfaces `EngineError`; the sidecar converts it to the JSON
//! envelope. Nothing is retried automatically.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid parameter value, unknown enumerant, out-of-range number,
    /// invalid regular expression, or unknown identity referenced as input.
    #[error("{0}")]
    Validation(String),

    /// Malformed request body or missing required field.
    #[error("{0}")]
    BadRequest(String),

    /// Write endpoint invoked without a valid token.
    #[error("Missing or invalid X-Agrafes-Token")]
    Unauthorized,

    /// Unknown route or unknown resource in a path parameter.
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Any other uncaught failure in storage, parser, filesystem, or worker.
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        EngineError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }

    /// Stable machine-readable error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::BadRequest(_) => "BAD_REQUEST",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Error family name used in the `error.type` field of the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Unauthorized => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            _ => "internal",
        }
    }

    /// HTTP status for the error family.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::BadRequest(_) => 400,
            EngineError::Unauthorized => 401,
            EngineError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_match_the_taxonomy() {
        assert_eq!(EngineError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(EngineError::validation("x").http_status(), 400);
        assert_eq!(EngineError::bad_request("x").code(), "BAD_REQUEST");
        assert_eq!(EngineError::Unauthorized.http_status(), 401);
        assert_eq!(EngineError::not_found("x").http_status(), 404);
        assert_eq!(EngineError::internal("x").code(), "INTERNAL_ERROR");
        assert_eq!(EngineError::internal("x").http_status(), 500);
    }
}
