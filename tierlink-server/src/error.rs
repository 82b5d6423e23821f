//! Server error types.

use tierlink_client::ClientError;
use tierlink_protocol::StatusCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tierlink_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] tierlink_store::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid JSON format")]
    InvalidJson,

    #[error("missing id_message or message_id")]
    MissingMessageId,

    #[error("missing operation field")]
    MissingOperation,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("missing {0} in params")]
    MissingParam(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("account not found")]
    AccountNotFound,

    #[error("downstream communication error: {0}")]
    Downstream(#[from] ClientError),

    /// Failure answered by the downstream tier, relayed unchanged.
    #[error("{err_info}")]
    Relayed { status: StatusCode, err_info: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Maps the error onto the status code sent on the wire.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Downstream(e) if e.is_timeout() => StatusCode::TIMEOUT,
            ServerError::Relayed { status, .. } => *status,
            _ => StatusCode::GENERIC_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServerError::AccountNotFound.status_code(),
            StatusCode::GENERIC_ERROR
        );
        assert_eq!(
            ServerError::UnknownOperation("x".into()).status_code(),
            StatusCode::GENERIC_ERROR
        );

        let timeout = ServerError::Downstream(ClientError::RequestTimeout(Duration::from_secs(1)));
        assert_eq!(timeout.status_code(), StatusCode::TIMEOUT);

        let closed = ServerError::Downstream(ClientError::ConnectionClosed);
        assert_eq!(closed.status_code(), StatusCode::GENERIC_ERROR);
        assert_eq!(
            closed.to_string(),
            "downstream communication error: connection closed"
        );

        let relayed = ServerError::Relayed {
            status: StatusCode::new(123).unwrap(),
            err_info: "from core".into(),
        };
        assert_eq!(relayed.status_code().to_string(), "123");
        assert_eq!(relayed.to_string(), "from core");
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ServerError::MissingParam("account_number").to_string(),
            "missing account_number in params"
        );
        assert_eq!(
            ServerError::MissingOperation.to_string(),
            "missing operation field"
        );
        assert_eq!(
            ServerError::UnknownOperation("unknown_op".into()).to_string(),
            "unknown operation: unknown_op"
        );
    }
}
