use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::error::ChatError;
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing or invalid x-user-id header")]
    Unauthenticated,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream service unavailable: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ChatError> for ServerError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Validation(msg) => ServerError::BadRequest(msg),
            ChatError::NotFound(msg) => ServerError::NotFound(msg),
            ChatError::Forbidden(msg) => ServerError::Forbidden(msg),
            ChatError::Conflict(msg) => ServerError::Conflict(msg),
            err @ ChatError::AlreadyWithdrawn(_) => ServerError::Conflict(err.to_string()),
            ChatError::Upstream(msg) => ServerError::Upstream(msg),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Upstream(detail) => {
                tracing::warn!(error = %detail, "Upstream failure while serving request");
                (StatusCode::BAD_GATEWAY, "Upstream service unavailable".to_string())
            }
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
