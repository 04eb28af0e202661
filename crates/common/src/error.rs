use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by Herald's stores, pipeline and HTTP handlers.
///
/// Responses carry `{"error": <message>, "code": <kind>}`. Storage failures
/// are logged in full but reported to the caller without driver detail.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// Authenticated, but the token's role does not cover the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Pipeline closed or shutting down.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Config(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable identifier clients can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) | AppError::Redis(_) => "storage",
            AppError::Config(_) => "config",
            AppError::Auth(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "invalid",
            AppError::Unavailable(_) => "unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Redis(_) => "Storage backend failed".to_string(),
            AppError::Config(msg)
            | AppError::Auth(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Unavailable(msg)
            | AppError::Internal(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }

        let body = json!({ "error": self.public_message(), "code": self.code() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        let cases = [
            (AppError::Auth("x".into()), StatusCode::UNAUTHORIZED, "unauthorized"),
            (AppError::Forbidden("x".into()), StatusCode::FORBIDDEN, "forbidden"),
            (AppError::Validation("x".into()), StatusCode::BAD_REQUEST, "invalid"),
            (AppError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            (AppError::Database(sqlx::Error::PoolTimedOut), StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        ];
        for (error, status, code) in cases {
            assert_eq!(error.status(), status, "{error}");
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn test_storage_detail_stays_out_of_response_message() {
        let error = AppError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(error.public_message(), "Storage backend failed");
        assert_eq!(AppError::NotFound("message 7".into()).public_message(), "message 7");
    }
}
