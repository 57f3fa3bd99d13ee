use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stratus_core::{CoreError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    AuthenticationError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    ConflictError(String),
    #[error("{0}")]
    ConfigurationError(String),
    #[error("{0}")]
    UpstreamError(String),
    #[error("{0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::ConfigurationError(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::UpstreamError(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => AppError::NotFoundError(msg),
            ErrorKind::Validation => AppError::ValidationError(msg),
            ErrorKind::Conflict => AppError::ConflictError(msg),
            ErrorKind::Configuration => AppError::ConfigurationError(msg),
            ErrorKind::External => AppError::UpstreamError(msg),
            ErrorKind::Authentication => AppError::AuthenticationError(msg),
            ErrorKind::Internal => AppError::InternalServerError(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, AppError>;
