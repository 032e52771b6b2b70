use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("incorrect delivery code")]
    OtpMismatch { attempts_remaining: u32 },

    #[error("no active assignment")]
    NoneActive,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Expired(msg) => (StatusCode::GONE, msg.clone()),
            AppError::OtpMismatch { attempts_remaining } => {
                let body = Json(json!({
                    "error": "incorrect delivery code",
                    "attempts_remaining": attempts_remaining,
                }));
                return (StatusCode::CONFLICT, body).into_response();
            }
            AppError::NoneActive => (
                StatusCode::BAD_REQUEST,
                "no active assignment".to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
