use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced across the broker.
///
/// The first five are the domain kinds; the rest are `#[from]` plumbing.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Circuit breaker open for destination host")]
    CircuitOpen,

    #[error("Upstream request failed after retries")]
    RequestFailed,

    #[error("Credentials rejected or token unusable")]
    TokenInvalid,

    #[error("Upstream unreachable")]
    NetworkError,

    #[error("No stored record for user")]
    UserNotFound,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Transport status for the compatibility surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::UserNotFound => StatusCode::NOT_FOUND,
            AppError::TokenInvalid => StatusCode::UNAUTHORIZED,
            AppError::CircuitOpen | AppError::RequestFailed | AppError::NetworkError => {
                StatusCode::GATEWAY_TIMEOUT
            }
            AppError::Io(_) | AppError::Json(_) | AppError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn client_message(&self) -> &'static str {
        match self {
            AppError::UserNotFound => "user_not_found",
            AppError::TokenInvalid => "token_invalid",
            AppError::CircuitOpen | AppError::RequestFailed | AppError::NetworkError => {
                "network_error"
            }
            _ => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "message": self.client_message(),
            "statusCode": status.as_u16().to_string(),
        }));
        (status, body).into_response()
    }
}
