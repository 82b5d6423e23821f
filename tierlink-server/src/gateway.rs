//! REST front end for the edge tier.
//!
//! Each HTTP call becomes one request on the edge's shared downstream
//! [`Connection`]:
//! - `GET /health` is answered locally
//! - `GET /ping` forwards a `ping`
//! - `GET /api/v1/accounts?account_number=N` forwards an account lookup
//!
//! Bodies are JSON. A non-`000` answer from downstream maps to HTTP 500
//! carrying the wire `status` and `message`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tierlink_client::{Client, ClientError, Connection};
use tierlink_protocol::message::format_timestamp;
use tierlink_protocol::StatusCode as WireStatus;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const ACCOUNTS_PATH: &str = "/api/v1/accounts";

/// HTTP gateway state shared by every HTTP connection.
#[derive(Clone)]
pub struct Gateway {
    service: Arc<str>,
    client: Client,
}

impl Gateway {
    pub fn new(service: impl Into<Arc<str>>, downstream: Arc<Connection>) -> Self {
        Self {
            service: service.into(),
            client: Client::from_connection(downstream),
        }
    }

    /// Routes one HTTP request.
    pub async fn handle(&self, method: &Method, uri: &Uri) -> Response<Full<Bytes>> {
        let path = uri.path();
        if !matches!(path, "/health" | "/ping" | ACCOUNTS_PATH) {
            return json_response(
                StatusCode::NOT_FOUND,
                json!({ "error": true, "message": "not found" }),
            );
        }
        if *method != Method::GET {
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({ "error": true, "message": "method not allowed" }),
            );
        }

        match path {
            "/health" => json_response(
                StatusCode::OK,
                json!({
                    "status": "healthy",
                    "service": &*self.service,
                    "timestamp": format_timestamp(chrono::Utc::now()),
                }),
            ),
            "/ping" => {
                let result = self.client.ping().await.map(|pong| json!(pong));
                forwarded(result)
            }
            _ => match query_param(uri, "account_number") {
                Some(number) if !number.is_empty() => {
                    tracing::debug!("HTTP account lookup for {}", number);
                    let result = self
                        .client
                        .get_account_by_account_number(number)
                        .await
                        .map(|lookup| json!(lookup));
                    forwarded(result)
                }
                _ => json_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": true, "message": "account_number parameter is required" }),
                ),
            },
        }
    }
}

/// Maps a downstream result onto the HTTP envelope.
fn forwarded(result: Result<Value, ClientError>) -> Response<Full<Bytes>> {
    match result {
        Ok(data) => json_response(StatusCode::OK, json!({ "error": false, "data": data })),
        Err(e) => {
            let (status, message) = match e {
                ClientError::ServerError { status, err_info } => (status, err_info),
                e if e.is_timeout() => (WireStatus::TIMEOUT, e.to_string()),
                e => (WireStatus::GENERIC_ERROR, e.to_string()),
            };
            tracing::debug!("Downstream call failed: {} {}", status, message);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": true, "message": message, "status": status }),
            )
        }
    }
}

/// Returns the raw value of `key` in the query string. Values are not
/// percent-decoded.
fn query_param<'a>(uri: &'a Uri, key: &str) -> Option<&'a str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Runs the HTTP gateway until `shutdown` fires.
pub async fn run_gateway(
    listener: TcpListener,
    gateway: Gateway,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    tracing::info!("HTTP gateway listening on http://{}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let gateway = gateway.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                let gateway = gateway.clone();
                                async move {
                                    Ok::<_, hyper::Error>(
                                        gateway.handle(req.method(), req.uri()).await,
                                    )
                                }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("HTTP connection {} error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("HTTP gateway accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("HTTP gateway shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Binds `addr` and runs the HTTP gateway.
pub async fn serve_gateway(
    addr: SocketAddr,
    gateway: Gateway,
    shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    run_gateway(listener, gateway, shutdown).await
}
