//! Error types shared across the server, the agent and the client.

use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::protocol::ErrorResponse;

/// Failures of one agent run. The relay turns these into a fallback reply.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request to model API failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API error: {status} - {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("agent did not finish within {0} model turns")]
    MaxTurns(usize),
}

/// Failures inside a single tool call. Reported back to the model, never to the user.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("tool not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("sessionId must not be empty")]
    MissingSession,

    #[error("message must not be empty")]
    EmptyMessage,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("chat turn failed: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::MissingSession | ChatError::EmptyMessage | ChatError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: {status} - {body}")]
    Status {
        context: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("malformed event frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("event stream closed before the final event")]
    StreamClosed,
}
