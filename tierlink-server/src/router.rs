//! Operation routing.
//!
//! The [`Router`] turns one inbound frame payload into exactly one response
//! envelope. Malformed JSON, missing fields, unknown operations, handler
//! errors and handler panics all become error responses.

use crate::error::ServerError;
use crate::metrics::Metrics;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tierlink_protocol::{Params, Request, Response};

/// Boxed future returned by an [`OperationHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Params, ServerError>> + Send>>;

/// Handles one registered operation.
///
/// A successful result becomes the response's `data`; an error becomes a
/// failure response with [`ServerError::status_code`].
pub trait OperationHandler: Send + Sync {
    fn call(&self, params: Params) -> HandlerFuture;
}

impl<F, Fut> OperationHandler for F
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Params, ServerError>> + Send + 'static,
{
    fn call(&self, params: Params) -> HandlerFuture {
        Box::pin(self(params))
    }
}

/// Dispatch table keyed by operation name.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
    metrics: Option<Arc<Metrics>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `operation`, replacing any previous one.
    pub fn register(
        mut self,
        operation: impl Into<String>,
        handler: impl OperationHandler + 'static,
    ) -> Self {
        self.handlers.insert(operation.into(), Arc::new(handler));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }

    /// Parses a raw frame payload and dispatches it.
    pub async fn dispatch(&self, payload: &[u8]) -> Response {
        match parse_request(payload) {
            Ok(request) => self.handle(request).await,
            Err((id_message, err)) => {
                tracing::warn!("Rejected request (id={:?}): {}", id_message, err);
                self.record_error(&err);
                Response::error(id_message, err.status_code(), err.to_string())
            }
        }
    }

    /// Dispatches a parsed request to its handler.
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            id_message,
            operation,
            params,
        } = request;

        let Some(handler) = self.handlers.get(&operation).cloned() else {
            let err = ServerError::UnknownOperation(operation);
            tracing::warn!("id={}: {}", id_message, err);
            self.record_error(&err);
            return Response::error(id_message, err.status_code(), err.to_string());
        };

        tracing::info!("Request: {} (id={})", operation, id_message);

        let timer = self.metrics.as_ref().map(|m| {
            m.requests_total
                .with_label_values(&[operation.as_str()])
                .inc();
            m.request_duration
                .with_label_values(&[operation.as_str()])
                .start_timer()
        });

        // The handler runs inside the future so a panic while building it is
        // caught as well.
        let result = AssertUnwindSafe(async move { handler.call(params).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ServerError::Internal(panic_message(panic.as_ref())))
            });
        drop(timer);

        match result {
            Ok(data) => {
                tracing::info!("Response: OK (id={})", id_message);
                Response::ok(id_message, data)
            }
            Err(err) => {
                tracing::info!(
                    "Response: {} {} (id={})",
                    err.status_code(),
                    err,
                    id_message
                );
                self.record_error(&err);
                Response::error(id_message, err.status_code(), err.to_string())
            }
        }
    }

    fn record_error(&self, err: &ServerError) {
        if let Some(ref metrics) = self.metrics {
            let status = err.status_code().to_string();
            metrics
                .errors_total
                .with_label_values(&[status.as_str()])
                .inc();
        }
    }
}

/// Parses a request leniently.
///
/// Accepts `message_id` in place of `id_message` and a missing or null
/// `params`. On failure returns the best-known message ID with the error.
fn parse_request(payload: &[u8]) -> Result<Request, (String, ServerError)> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|_| (String::new(), ServerError::InvalidJson))?;
    let Value::Object(mut obj) = value else {
        return Err((String::new(), ServerError::InvalidJson));
    };

    let id_message = ["id_message", "message_id"]
        .iter()
        .find_map(|key| match obj.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or((String::new(), ServerError::MissingMessageId))?;

    let operation = match obj.remove("operation") {
        Some(Value::String(op)) if !op.is_empty() => op,
        _ => return Err((id_message, ServerError::MissingOperation)),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Params::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err((
                id_message,
                ServerError::InvalidRequest("params must be a JSON object".to_string()),
            ))
        }
    };

    Ok(Request {
        id_message,
        operation,
        params,
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
