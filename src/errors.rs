use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ApiResponse;

// --- Read path errors ---

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("malformed backend payload: {0}")]
    Integration(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cache backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

// --- Write path errors ---

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("{action} failed with status: {status}")]
    Status { action: &'static str, status: u16 },

    #[error("{action} rejected by backend: {message}")]
    Rejected { action: &'static str, message: String },

    #[error("Proxy backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

// --- Download gate errors ---

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    #[error("cannot {event} while gate is {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("Download session not found: {0}")]
    SessionNotFound(uuid::Uuid),
}

// --- Web Layer Error ---

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Missing form field: {0}")]
    MissingFormField(String),
    #[error("Error processing multipart form data: {0}")]
    MultipartError(#[from] axum::extract::multipart::MultipartError),
    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Could not update image catalog")]
    Mutation(#[source] MutationError),
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        AppError::Mutation(err)
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            // 4xx Client Errors
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::MissingFormField(field) => (StatusCode::BAD_REQUEST, format!("Missing form field: {}", field)),
            AppError::MultipartError(e) => (StatusCode::BAD_REQUEST, format!("Invalid multipart form data: {}", e)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Fetch(FetchError::NotFound(_)) => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::Gate(e @ GateError::SessionNotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            AppError::Gate(e @ GateError::InvalidTransition { .. }) => (StatusCode::CONFLICT, e.to_string()),

            // 5xx Server Errors
            AppError::Fetch(FetchError::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "request timeout".to_string()),
            AppError::Fetch(e) => {
                tracing::error!(error.source = ?e, "Image backend read failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            AppError::Mutation(e) => {
                tracing::error!(error.source = ?e, "Image backend write failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            AppError::ConfigError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error".to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal server error occurred".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();

        tracing::warn!(error.message = %error_message, error.status = %status, error.detail = %self, "Responding with error");

        let body = Json(ApiResponse::<()>::err(error_message));
        (status, body).into_response()
    }
}
