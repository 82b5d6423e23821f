//! Client error types.

use tierlink_protocol::StatusCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tierlink_protocol::ProtocolError),

    #[error("connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("request timeout after {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("duplicate message id: {0}")]
    DuplicateMessageId(String),

    #[error("server error: {status} - {err_info}")]
    ServerError { status: StatusCode, err_info: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns whether this error was caused by a call timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::RequestTimeout(_) | ClientError::ConnectTimeout(_)
        )
    }

    /// Returns whether the connection to the peer was lost or never made.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Transport(_) | ClientError::ConnectionClosed
        )
    }
}
