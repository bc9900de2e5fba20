use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error taxonomy shared by every component, per the error-handling design:
/// transient I/O, decode failures, invariant violations, write conflicts,
/// and programmer errors at mutation boundaries.
#[derive(Debug, thiserror::Error)]
pub enum MantleError {
    #[error("storage unavailable: {0}")]
    TransientIo(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Programmer(String),
}

impl From<sqlx::Error> for MantleError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                MantleError::Conflict(db.message().to_string())
            }
            other => MantleError::TransientIo(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for MantleError {
    fn into_response(self) -> Response {
        let status = match &self {
            MantleError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            MantleError::Decode(_) => StatusCode::BAD_REQUEST,
            MantleError::Invariant(_) => StatusCode::CONFLICT,
            MantleError::Conflict(_) => StatusCode::CONFLICT,
            MantleError::Programmer(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub type MantleResult<T> = Result<T, MantleError>;
