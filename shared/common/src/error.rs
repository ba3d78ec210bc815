use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds shared by every transport (socket, worker, listener).
/// The signaling hub flattens these into a single `error` frame with
/// `{code, message}`; nothing below ever carries a stack trace outward.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Unauthenticated(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::BadInput(_) => 400,
            AppError::Conflict(_) => 409,
            AppError::Timeout(_) => 408,
            AppError::Validation(_) => 422,
            AppError::External(_) => 502,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Redis(_) => "CACHE_ERROR",
            AppError::Unauthenticated(_) => "UNAUTHENTICATED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::BadInput(_) => "BAD_INPUT",
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::External(_) => "EXTERNAL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Wire shape of an error surfaced to a socket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorFrame {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(AppError::Unauthenticated("no identity".into()).status_code(), 401);
        assert_eq!(AppError::BadInput("self call".into()).status_code(), 400);
        assert_eq!(AppError::Conflict("busy".into()).status_code(), 409);
        assert_eq!(AppError::Timeout("lock wait".into()).status_code(), 408);
        assert_eq!(AppError::Validation("magic bytes".into()).status_code(), 422);
        assert_eq!(AppError::External("sfu".into()).status_code(), 502);
    }

    #[test]
    fn error_frame_hides_internals() {
        let err = AppError::Internal("connection pool exhausted".into());
        let frame = ErrorFrame::from(&err);
        assert_eq!(frame.code, "INTERNAL_ERROR");
        assert!(!frame.message.contains("panicked"));
    }
}
