//! Tier operation handlers.
//!
//! Every tier answers `ping` itself. The core tier answers account lookups
//! from its [`AccountStore`]; the switch and edge tiers validate the request
//! and relay it to the next tier over their downstream [`Connection`].

use crate::error::ServerError;
use crate::router::{HandlerFuture, OperationHandler, Router};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tierlink_client::Connection;
use tierlink_protocol::message::{to_params, AccountParams, Operation, PingResult};
use tierlink_protocol::{Params, Request};
use tierlink_store::AccountStore;

/// Answers `ping` with this tier's service name.
pub struct PingHandler {
    service: Arc<str>,
}

impl PingHandler {
    pub fn new(service: impl Into<Arc<str>>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl OperationHandler for PingHandler {
    fn call(&self, _params: Params) -> HandlerFuture {
        let service = self.service.clone();
        Box::pin(async move { Ok(to_params(&PingResult::pong(service.as_ref()))?) })
    }
}

/// Looks accounts up in the local store.
pub struct AccountLookupHandler {
    store: Arc<dyn AccountStore>,
}

impl AccountLookupHandler {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }
}

impl OperationHandler for AccountLookupHandler {
    fn call(&self, params: Params) -> HandlerFuture {
        let store = self.store.clone();
        Box::pin(async move {
            let account = parse_account_params(&params)?;
            tracing::debug!("Looking up account {}", account.account_number);
            let lookup = store
                .find_by_account_number(&account.account_number)?
                .ok_or(ServerError::AccountNotFound)?;
            Ok(to_params(&lookup)?)
        })
    }
}

/// Relays an operation to the downstream tier.
///
/// The downstream answer is passed back unchanged: data on success, status
/// and `err_info` on failure. Transport failures and timeouts surface as
/// [`ServerError::Downstream`].
pub struct ForwardHandler {
    operation: Operation,
    downstream: Arc<Connection>,
    timeout: Duration,
}

impl ForwardHandler {
    pub fn new(operation: Operation, downstream: Arc<Connection>, timeout: Duration) -> Self {
        Self {
            operation,
            downstream,
            timeout,
        }
    }
}

impl OperationHandler for ForwardHandler {
    fn call(&self, params: Params) -> HandlerFuture {
        let operation = self.operation;
        let downstream = self.downstream.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let params = match operation {
                Operation::GetAccountByAccountNumber => to_params(&parse_account_params(&params)?)?,
                Operation::Ping => params,
            };

            // A fresh ID per hop keeps IDs from different upstream
            // connections from colliding on the shared downstream socket.
            let request = Request::for_operation(operation).with_params(params);
            let response = downstream.call(request, timeout).await.map_err(|e| {
                tracing::warn!("Downstream {} failed: {}", operation, e);
                ServerError::Downstream(e)
            })?;

            if response.is_ok() {
                Ok(response.data.unwrap_or_default())
            } else {
                Err(ServerError::Relayed {
                    status: response.status,
                    err_info: response.err_info,
                })
            }
        })
    }
}

/// Extracts and validates `account_number`.
fn parse_account_params(params: &Params) -> Result<AccountParams, ServerError> {
    match params.get("account_number") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(AccountParams {
            account_number: s.trim().to_string(),
        }),
        Some(Value::Number(n)) => Ok(AccountParams {
            account_number: n.to_string(),
        }),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            Err(ServerError::MissingParam("account_number"))
        }
        Some(_) => Err(ServerError::InvalidRequest(
            "account_number must be a string".to_string(),
        )),
    }
}

/// Builds the core tier's router.
pub fn core_router(service: &str, store: Arc<dyn AccountStore>) -> Router {
    Router::new()
        .register(Operation::Ping.as_str(), PingHandler::new(service))
        .register(
            Operation::GetAccountByAccountNumber.as_str(),
            AccountLookupHandler::new(store),
        )
}

/// Builds the router of a tier that relays lookups downstream.
pub fn relay_router(service: &str, downstream: Arc<Connection>, timeout: Duration) -> Router {
    Router::new()
        .register(Operation::Ping.as_str(), PingHandler::new(service))
        .register(
            Operation::GetAccountByAccountNumber.as_str(),
            ForwardHandler::new(Operation::GetAccountByAccountNumber, downstream, timeout),
        )
}
