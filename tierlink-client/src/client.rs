//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use std::sync::Arc;
use tierlink_protocol::message::{AccountLookup, Operation, Params, PingResult};
use tierlink_protocol::{Request, Response};

/// Typed client over a shared [`Connection`].
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) {
        self.conn.disconnect().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Sends a raw request and returns the response envelope as-is.
    pub async fn send(&self, request: Request) -> Result<Response, ClientError> {
        self.conn.request(request).await
    }

    async fn request(&self, op: Operation, params: Params) -> Result<Response, ClientError> {
        let response = self
            .send(Request::for_operation(op).with_params(params))
            .await?;

        if response.is_error() {
            return Err(ClientError::ServerError {
                status: response.status,
                err_info: response.err_info,
            });
        }

        Ok(response)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<PingResult, ClientError> {
        let response = self.request(Operation::Ping, Params::new()).await?;
        Ok(response.data_as()?)
    }

    /// Looks up an account and its owning customer.
    pub async fn get_account_by_account_number(
        &self,
        account_number: &str,
    ) -> Result<AccountLookup, ClientError> {
        let mut params = Params::new();
        params.insert("account_number".into(), account_number.into());

        let response = self
            .request(Operation::GetAccountByAccountNumber, params)
            .await?;
        Ok(response.data_as()?)
    }
}
