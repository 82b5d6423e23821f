//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::router::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tierlink_protocol::{Decoder, Encoder, ProtocolError, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Semaphore};

const READ_BUFFER_SIZE: usize = 8192;

/// Upper bound for the per-connection dispatch limit.
pub const MAX_IN_FLIGHT_PER_CONNECTION: usize = 65_536;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum requests dispatched concurrently on one connection.
    pub max_in_flight_per_connection: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field(
                "max_in_flight_per_connection",
                &self.max_in_flight_per_connection,
            )
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, tierlink_protocol::DEFAULT_CORE_PORT)),
            max_connections: 1000,
            max_in_flight_per_connection: 256,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server settings from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.bind_addr(),
            max_connections: config.network.max_connections,
            max_in_flight_per_connection: config.network.max_in_flight_per_connection,
            metrics: None,
        }
    }

    /// Sets the per-connection dispatch limit, clamped to
    /// `1..=MAX_IN_FLIGHT_PER_CONNECTION`.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight_per_connection = clamp_in_flight(limit) as usize;
        self
    }

    /// Sets the connection limit.
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Framed request/response server for one tier.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl Server {
    /// Creates a new server dispatching through `router`.
    pub fn new(config: ServerConfig, router: Router) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let router = match config.metrics {
            Some(ref metrics) => router.with_metrics(metrics.clone()),
            None => router,
        };
        Self {
            config,
            router: Arc::new(router),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Runs the accept loop on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} ({} operations)",
            listener.local_addr()?,
            self.router.operations().len()
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let conn = self.connection_handler();
                            let stats = self.stats.clone();
                            let metrics = self.config.metrics.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let peer = addr.to_string();
                                tracing::info!("Client connected: {}", peer);

                                if let Err(e) = conn.serve(tcp_stream, &peer, conn_shutdown).await {
                                    tracing::debug!("Connection {} error: {}", peer, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", peer);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves one already established connection until the peer closes it,
    /// a framing error occurs, or the server shuts down.
    pub async fn serve_connection<S>(&self, stream: S, peer: &str) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.connection_handler()
            .serve(stream, peer, self.shutdown.subscribe())
            .await
    }

    fn connection_handler(&self) -> ConnectionHandler {
        ConnectionHandler {
            router: self.router.clone(),
            stats: self.stats.clone(),
            max_in_flight: clamp_in_flight(self.config.max_in_flight_per_connection),
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn clamp_in_flight(limit: usize) -> u32 {
    let limit = limit.clamp(1, MAX_IN_FLIGHT_PER_CONNECTION);
    u32::try_from(limit).unwrap_or(u32::MAX)
}

/// Per-connection state shared by the read loop and its request tasks.
struct ConnectionHandler {
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    max_in_flight: u32,
}

impl ConnectionHandler {
    async fn serve<S>(
        self,
        stream: S,
        peer: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let in_flight = Arc::new(Semaphore::new(self.max_in_flight as usize));
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = 'read: loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            if let Err(e) = decoder.finish() {
                                tracing::warn!(
                                    "[{}] Connection closed mid-frame ({} bytes buffered): {}",
                                    peer,
                                    decoder.buffered(),
                                    e
                                );
                                break 'read Err(ServerError::Protocol(e));
                            }
                            tracing::debug!("[{}] Connection closed by client", peer);
                            break 'read Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", peer, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", peer, e);
                            break 'read Err(ServerError::Io(e));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    break 'read Err(ServerError::ShuttingDown);
                }
            }

            loop {
                let frame = match decoder.decode_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Framing error, closing connection: {}", peer, e);
                        break 'read Err(ServerError::Protocol(e));
                    }
                };

                // Waiting here stops reading, which pushes back on the peer.
                let Ok(permit) = in_flight.clone().acquire_owned().await else {
                    break 'read Err(ServerError::ShuttingDown);
                };

                self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                let router = self.router.clone();
                let stats = self.stats.clone();
                let writer = writer.clone();
                let peer = peer.to_string();

                tokio::spawn(async move {
                    let response = router.dispatch(&frame.payload).await;
                    if response.is_error() {
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Err(e) = write_response(&writer, response, &peer).await {
                        tracing::debug!("[{}] Failed to write response: {}", peer, e);
                    }
                    drop(permit);
                });
            }
        };

        // Let dispatched requests finish writing before the socket goes away.
        if !matches!(result, Err(ServerError::ShuttingDown)) {
            let _ = in_flight.acquire_many(self.max_in_flight).await;
        }
        let _ = writer.lock().await.shutdown().await;

        result
    }
}

/// Encodes and writes one response under the connection's writer lock.
///
/// A response too large for a frame is replaced by a failure response
/// carrying the same message ID.
async fn write_response<W>(
    writer: &Mutex<WriteHalf<W>>,
    response: Response,
    peer: &str,
) -> Result<(), ServerError>
where
    W: AsyncWrite,
{
    let bytes = match Encoder::encode_response(&response) {
        Ok(bytes) => bytes,
        Err(ProtocolError::OversizedPayload { .. }) => {
            tracing::warn!(
                "[{}] Response for id={} too large, replacing",
                peer,
                response.id_message
            );
            let fallback = Response::error(
                response.id_message,
                StatusCode::GENERIC_ERROR,
                "response too large",
            );
            Encoder::encode_response(&fallback)?
        }
        Err(e) => return Err(e.into()),
    };

    tracing::debug!("[{}] Writing {} bytes", peer, bytes.len());
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
