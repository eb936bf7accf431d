use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExperimentsError>;

/// Service-level error taxonomy, mapped to the logical codes of the external
/// interface (NOT_FOUND, CONFLICT, INVALID_INPUT, NOT_ELIGIBLE, UNAVAILABLE,
/// INTERNAL).
#[derive(Debug, Error)]
pub enum ExperimentsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("experiment not eligible: {0}")]
    NotEligible(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("clickhouse error: {0}")]
    ClickHouse(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    /// Logical error code from the external interface, distinct from the
    /// HTTP status it happens to be mapped to.
    pub logical_code: &'static str,
}

impl ExperimentsError {
    fn logical_code(&self) -> &'static str {
        match self {
            ExperimentsError::NotFound(_) => "NOT_FOUND",
            ExperimentsError::Conflict(_) => "CONFLICT",
            ExperimentsError::Validation(_) | ExperimentsError::InvalidTimeRange(_) => {
                "INVALID_INPUT"
            }
            ExperimentsError::NotEligible(_) => "NOT_ELIGIBLE",
            ExperimentsError::Unavailable(_) | ExperimentsError::Redis(_) => "UNAVAILABLE",
            ExperimentsError::Database(_)
            | ExperimentsError::Kafka(_)
            | ExperimentsError::ClickHouse(_)
            | ExperimentsError::Internal(_) => "INTERNAL",
        }
    }
}

impl ResponseError for ExperimentsError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        HttpResponse::build(code).json(ErrorResponse {
            error: self.to_string(),
            code: code.as_u16(),
            logical_code: self.logical_code(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ExperimentsError::NotFound(_) => StatusCode::NOT_FOUND,
            ExperimentsError::Conflict(_) => StatusCode::CONFLICT,
            ExperimentsError::Validation(_)
            | ExperimentsError::NotEligible(_)
            | ExperimentsError::InvalidTimeRange(_) => StatusCode::BAD_REQUEST,
            ExperimentsError::Unavailable(_) | ExperimentsError::Redis(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ExperimentsError::Database(_)
            | ExperimentsError::Kafka(_)
            | ExperimentsError::ClickHouse(_)
            | ExperimentsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ExperimentsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ExperimentsError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                ExperimentsError::Unavailable("database pool exhausted".to_string())
            }
            other => ExperimentsError::Database(other.to_string()),
        }
    }
}

impl From<experiments_cache::CacheError> for ExperimentsError {
    fn from(err: experiments_cache::CacheError) -> Self {
        ExperimentsError::Unavailable(format!("cache: {err}"))
    }
}
