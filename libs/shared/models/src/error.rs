use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden ({code}): {message}")]
    Forbidden { code: String, message: String },

    #[error("Not Found ({code}): {message}")]
    NotFound { code: String, message: String },

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Conflict ({code}): {message}")]
    Conflict {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Rejected { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::Auth(msg) | AppError::BadRequest(msg) => {
                json!({ "error": msg })
            }
            AppError::Forbidden { code, message }
            | AppError::Rejected { code, message }
            | AppError::NotFound { code, message } => {
                json!({ "error": message, "code": code })
            }
            AppError::Conflict { code, message, retryable } => {
                json!({ "error": message, "code": code, "retryable": retryable })
            }
            // Internal details stay in the logs.
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                json!({ "error": "Internal server error" })
            }
        };

        if !status.is_server_error() {
            tracing::debug!("Request rejected: {}: {}", status, self);
        }

        (status, Json(body)).into_response()
    }
}
