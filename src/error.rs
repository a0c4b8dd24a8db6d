//! Application error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error types
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Malformed input: bad mapping definition, category not covered by a
    /// mapping, unknown formula variable, invalid query group.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Duplicate mapping or derived metric name
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Referenced mapping, derived metric or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A category executor or sub-query failed, or the group deadline passed
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// HTTP status for CRUD-style endpoints.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ExecutionFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status reported for a failed query group.
    ///
    /// A missing mapping or derived metric mid-execution is an integrity
    /// problem, since names are picked from previously listed entities, so
    /// `NotFound` is reported as a server error here.
    pub fn query_status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            other => other.status_code(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::InvalidInput(msg)
            | AppError::Conflict(msg)
            | AppError::NotFound(msg)
            | AppError::ExecutionFailure(msg)
            | AppError::DatabaseError(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": self.message(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return AppError::Conflict("Entity with the same name exists".into());
            }
        }
        AppError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}
