use axum::http::StatusCode;
use std::fmt::Display;

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    let status = match &err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StatusCode::CONFLICT,    // unique_violation
            Some("23503") => StatusCode::BAD_REQUEST, // foreign_key_violation
            Some("23502") => StatusCode::BAD_REQUEST, // not_null_violation
            Some("22P02") => StatusCode::BAD_REQUEST, // invalid_text_representation
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    tracing::error!(error = %err, status = %status, "database error");

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };

    (status, message.to_string())
}

/// Job-level error taxonomy. Transient failures are retried at the call
/// site and only surface here when retries are exhausted inside a single
/// node's work; systemic failures abort the job and mark it failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transient i/o: {0}")]
    Transient(String),
    #[error("{0}")]
    Systemic(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Transient(_) => "transient_io",
            PipelineError::Systemic(_) => "systemic",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Systemic(format!("warm store error: {err}"))
    }
}

impl From<crate::warehouse::WarehouseError> for PipelineError {
    fn from(err: crate::warehouse::WarehouseError) -> Self {
        match err {
            crate::warehouse::WarehouseError::Transient(message) => {
                PipelineError::Transient(message)
            }
            other => PipelineError::Systemic(other.to_string()),
        }
    }
}
