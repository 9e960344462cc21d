//! Error taxonomy for the chat pipeline.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Message shown to callers whenever a remote dependency fails.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";

#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad or empty input from the caller.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Embedding or vector store call failed.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// LLM call failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Missing or malformed startup configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval(message.into())
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Retrieval(_)
            | ChatError::Generation(_)
            | ChatError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation_error",
            ChatError::Retrieval(_) => "retrieval_error",
            ChatError::Generation(_) => "generation_error",
            ChatError::Configuration(_) => "configuration_error",
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let message = match &self {
            ChatError::Validation(msg) => msg.clone(),
            other => {
                tracing::error!(error = %other, "chat request failed");
                GENERIC_FAILURE_MESSAGE.to_string()
            }
        };

        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": message,
            }
        }));

        (self.status(), body).into_response()
    }
}
