//! Outbound connection with message-ID correlation.
//!
//! A [`Connection`] owns one TCP socket to a downstream peer and lets any
//! number of tasks issue calls over it concurrently. Each call is tagged with
//! a message ID and parked in a pending table; a single background reader
//! decodes response frames and hands each one to the caller waiting on its ID.

use crate::error::ClientError;
use crate::id::MessageIdGenerator;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierlink_protocol::{Decoder, Encoder, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// How long `disconnect()` waits for the reader task before aborting it.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Downstream address (`host:port`).
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default timeout for [`Connection::request`].
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Call counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    calls: AtomicU64,
    timeouts: AtomicU64,
    transport_errors: AtomicU64,
    unmatched_responses: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub unmatched_responses: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
        }
    }
}

struct PendingCall {
    token: u64,
    created_at: Instant,
    tx: oneshot::Sender<Response>,
}

/// State shared between the connection and its reader task.
struct Shared {
    pending: SyncMutex<HashMap<String, PendingCall>>,
    state: AtomicU8,
    generation: AtomicU64,
    next_token: AtomicU64,
    stats: ConnectionStats,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn register(&self, id: &str) -> Result<(u64, oneshot::Receiver<Response>), ClientError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(ClientError::DuplicateMessageId(id.to_string()));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id.to_string(),
            PendingCall {
                token,
                created_at: Instant::now(),
                tx,
            },
        );
        Ok((token, rx))
    }

    /// Removes the entry for `id` only if it still belongs to the caller
    /// holding `token`.
    fn unregister(&self, id: &str, token: u64) {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|call| call.token == token) {
            pending.remove(id);
        }
    }

    /// Hands a response to the caller waiting on its ID.
    fn complete(&self, response: Response) {
        let call = self.pending.lock().remove(&response.id_message);
        match call {
            Some(call) => {
                tracing::debug!(
                    "Response id={} matched after {:?}",
                    response.id_message,
                    call.created_at.elapsed()
                );
                // Receiver gone means the caller was cancelled; nothing to do.
                let _ = call.tx.send(response);
            }
            None => {
                self.stats
                    .unmatched_responses
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Discarding unmatched response id={} status={}",
                    response.id_message,
                    response.status
                );
            }
        }
    }

    fn reader_exited(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(ConnectionState::Disconnected);
            tracing::info!("Downstream connection lost: {}", reason);
        } else {
            tracing::debug!("Stale reader (generation {}) exited: {}", generation, reason);
        }
    }
}

/// Removes a pending entry when the waiting call ends without a response:
/// timeout, write failure, or the caller's future being dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: &'a str,
    token: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.unregister(self.id, self.token);
        }
    }
}

/// Holds the writer for the duration of one frame write.
///
/// If the write does not finish, either because it failed or because the
/// calling future was dropped part way through, the socket is discarded and
/// the connection marked disconnected. No frame may follow a partial one on
/// the same socket; the next call reconnects.
struct FrameWrite<'a> {
    writer: MutexGuard<'a, Option<OwnedWriteHalf>>,
    shared: &'a Shared,
    finished: bool,
}

impl Drop for FrameWrite<'_> {
    fn drop(&mut self) {
        if !self.finished && self.writer.take().is_some() {
            self.shared.set_state(ConnectionState::Disconnected);
            tracing::warn!("Frame write did not complete, discarding downstream socket");
        }
    }
}

struct ReaderHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// A persistent, multiplexed connection to a downstream peer.
pub struct Connection {
    config: ConnectionConfig,
    ids: MessageIdGenerator,
    /// Serializes connect/disconnect.
    lifecycle: Mutex<()>,
    /// Write half of the socket; one frame is written at a time.
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: SyncMutex<Option<ReaderHandle>>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            ids: MessageIdGenerator::new(),
            lifecycle: Mutex::new(()),
            writer: Mutex::new(None),
            reader: SyncMutex::new(None),
            shared: Arc::new(Shared {
                pending: SyncMutex::new(HashMap::new()),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                generation: AtomicU64::new(0),
                next_token: AtomicU64::new(1),
                stats: ConnectionStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the peer and starts the background reader.
    ///
    /// Does nothing if already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Disconnected);
                tracing::debug!("Connection to {} failed: {}", self.config.addr, e);
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Disconnected);
                tracing::debug!("Connection to {} timed out", self.config.addr);
                return Err(ClientError::ConnectTimeout(self.config.connect_timeout));
            }
        };
        stream.set_nodelay(true).ok();

        // A reader left over from a dropped socket must not outlive it.
        self.stop_reader().await;

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ConnectionState::Connected);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(read_loop(
            self.shared.clone(),
            read_half,
            shutdown_rx,
            generation,
            self.config.read_buffer_size,
        ));
        *self.reader.lock() = Some(ReaderHandle {
            shutdown: shutdown_tx,
            join,
        });

        tracing::info!("Connected to downstream {}", self.config.addr);
        Ok(())
    }

    /// Sends a request and waits for its response using the configured
    /// request timeout.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        self.call(request, self.config.request_timeout).await
    }

    /// Sends a request and waits up to `timeout` for the matching response.
    ///
    /// Connects first if needed. An empty `id_message` is replaced with a
    /// generated one. On timeout only this call's pending entry is removed;
    /// a response arriving later is counted as unmatched and dropped.
    pub async fn call(
        &self,
        mut request: Request,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        if !self.is_connected() {
            self.connect().await?;
        }

        if request.id_message.is_empty() {
            request.id_message = self.ids.next_id();
        }
        let encoded = Encoder::encode_request(&request)?;
        let id = request.id_message;

        let (token, rx) = self.shared.register(&id)?;
        let mut guard = PendingGuard {
            shared: self.shared.as_ref(),
            id: &id,
            token,
            armed: true,
        };
        self.shared.stats.calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut write = FrameWrite {
                writer: self.writer.lock().await,
                shared: self.shared.as_ref(),
                finished: false,
            };
            let result = match write.writer.as_mut() {
                Some(w) => w.write_all(&encoded).await,
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "connection is not open",
                )),
            };
            match result {
                Ok(()) => write.finished = true,
                Err(e) => {
                    drop(write);
                    self.shared
                        .stats
                        .transport_errors
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Write of request id={} failed: {}", id, e);
                    return Err(ClientError::Transport(e.to_string()));
                }
            }
        }
        tracing::debug!("Request id={} sent ({} bytes)", id, encoded.len());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                guard.disarm();
                Ok(response)
            }
            Ok(Err(_)) => {
                // Sender dropped by disconnect(); the entry is already gone.
                guard.disarm();
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                self.shared.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Request id={} timed out after {:?}", id, timeout);
                Err(ClientError::RequestTimeout(timeout))
            }
        }
    }

    /// Closes the socket, stops the reader and fails all waiting calls with
    /// [`ClientError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.stop_reader().await;

        let dropped = {
            let mut pending = self.shared.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        tracing::debug!(
            "Disconnected from {} ({} pending calls dropped)",
            self.config.addr,
            dropped
        );
    }

    async fn stop_reader(&self) {
        let handle = self.reader.lock().take();
        if let Some(ReaderHandle { shutdown, mut join }) = handle {
            let _ = shutdown.send(());
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut join)
                .await
                .is_err()
            {
                tracing::warn!("Reader task did not stop in time, aborting");
                join.abort();
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.join.abort();
        }
    }
}

/// Reads response frames and completes pending calls until the socket
/// closes, a frame fails to decode, or shutdown is signalled.
async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut shutdown: oneshot::Receiver<()>,
    generation: u64,
    buffer_size: usize,
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; buffer_size];

    let reason = 'read: loop {
        let n = tokio::select! {
            _ = &mut shutdown => break 'read "shutdown requested",
            result = reader.read(&mut buf) => match result {
                Ok(0) => break 'read "peer closed the connection",
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("Read error: {}", e);
                    break 'read "read error";
                }
            },
        };

        tracing::debug!("Reader received {} bytes", n);
        decoder.extend(&buf[..n]);

        loop {
            match decoder.decode_response() {
                Ok(Some(response)) => shared.complete(response),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to decode response frame: {}", e);
                    break 'read "undecodable frame";
                }
            }
        }
    };

    shared.reader_exited(generation, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tierlink_protocol::message::to_params;
    use tierlink_protocol::StatusCode;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    /// A peer that forwards every decoded request to the test and writes
    /// whatever responses the test sends back.
    async fn scripted_peer() -> (
        String,
        mpsc::UnboundedReceiver<Request>,
        mpsc::UnboundedSender<Response>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Response>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = stream.into_split();
            tokio::spawn(async move {
                while let Some(resp) = resp_rx.recv().await {
                    let bytes = Encoder::encode_response(&resp).unwrap();
                    if wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });

            let mut decoder = Decoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Ok(Some(req)) = decoder.decode_request() {
                    if req_tx.send(req).is_err() {
                        return;
                    }
                }
            }
        });

        (addr, req_rx, resp_tx)
    }

    /// A peer that answers every request with its own `n` param, after a
    /// delay that scrambles the reply order.
    async fn echo_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(echo_stream(stream));
            }
        });

        addr
    }

    async fn echo_stream(stream: TcpStream) {
        let (mut rd, wr) = stream.into_split();
        let wr = Arc::new(Mutex::new(wr));
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
            while let Ok(Some(req)) = decoder.decode_request() {
                let wr = wr.clone();
                tokio::spawn(async move {
                    let n = req.params.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(n % 7)).await;
                    let data = to_params(&json!({ "n": n })).unwrap();
                    let bytes =
                        Encoder::encode_response(&Response::ok(req.id_message, data)).unwrap();
                    let _ = wr.lock().await.write_all(&bytes).await;
                });
            }
        }
    }

    fn reply_to(req: &Request, tag: &str) -> Response {
        Response::ok(
            req.id_message.clone(),
            to_params(&json!({ "tag": tag })).unwrap(),
        )
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:5001");
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new("127.0.0.1:5001").with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config =
            ConnectionConfig::new("127.0.0.1:5001").with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_lazy_connect() {
        let addr = echo_peer().await;
        let conn = Connection::new(ConnectionConfig::new(addr));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let resp = assert_ok!(
            conn.call(
                Request::new("", "ping").with_param("n", 1),
                Duration::from_secs(5)
            )
            .await
        );
        assert!(resp.is_ok());
        assert!(!resp.id_message.is_empty());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.stats().calls, 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let addr = echo_peer().await;
        let conn = Connection::new(ConnectionConfig::new(addr));
        assert_ok!(conn.connect().await);
        assert_ok!(conn.connect().await);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = Connection::new(ConnectionConfig::new(addr));
        let err = assert_err!(conn.connect().await);
        assert!(matches!(err, ClientError::Io(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (addr, mut requests, responses) = scripted_peer().await;
        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));
        assert_ok!(conn.connect().await);

        let c1 = conn.clone();
        let first = tokio::spawn(async move {
            c1.call(Request::new("a", "ping"), Duration::from_secs(5))
                .await
        });
        let req_a = requests.recv().await.unwrap();

        let c2 = conn.clone();
        let second = tokio::spawn(async move {
            c2.call(Request::new("b", "ping"), Duration::from_secs(5))
                .await
        });
        let req_b = requests.recv().await.unwrap();

        // Answer the second request first.
        responses.send(reply_to(&req_b, "for-b")).unwrap();
        responses.send(reply_to(&req_a, "for-a")).unwrap();

        let resp_a = first.await.unwrap().unwrap();
        let resp_b = second.await.unwrap().unwrap();
        assert_eq!(resp_a.id_message, "a");
        assert_eq!(resp_a.data.unwrap()["tag"], "for-a");
        assert_eq!(resp_b.id_message, "b");
        assert_eq!(resp_b.data.unwrap()["tag"], "for-b");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_unmatched() {
        let (addr, mut requests, responses) = scripted_peer().await;
        let conn = Connection::new(ConnectionConfig::new(addr));

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = assert_err!(conn.call(Request::new("x", "ping"), timeout).await);
        assert!(matches!(err, ClientError::RequestTimeout(_)));
        assert!(started.elapsed() >= timeout);
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().timeouts, 1);

        // The peer answers after the caller gave up.
        let stale = requests.recv().await.unwrap();
        responses.send(reply_to(&stale, "stale")).unwrap();
        wait_until(|| conn.stats().unmatched_responses == 1).await;
        assert!(conn.is_connected());

        // A new call reusing the ID gets its own answer, not the stale one.
        let conn = Arc::new(conn);
        let c = conn.clone();
        let retry = tokio::spawn(async move {
            c.call(Request::new("x", "ping"), Duration::from_secs(5))
                .await
        });
        let req = requests.recv().await.unwrap();
        responses.send(reply_to(&req, "fresh")).unwrap();
        let resp = retry.await.unwrap().unwrap();
        assert_eq!(resp.data.unwrap()["tag"], "fresh");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (addr, mut requests, _responses) = scripted_peer().await;
        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));

        let c = conn.clone();
        let _waiting = tokio::spawn(async move {
            c.call(Request::new("dup", "ping"), Duration::from_secs(30))
                .await
        });
        requests.recv().await.unwrap();
        assert_eq!(conn.pending_count(), 1);

        let err = assert_err!(
            conn.call(Request::new("dup", "ping"), Duration::from_secs(1))
                .await
        );
        assert!(matches!(err, ClientError::DuplicateMessageId(id) if id == "dup"));
        assert_eq!(conn.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_removes_entry() {
        let (addr, mut requests, _responses) = scripted_peer().await;
        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));

        let c = conn.clone();
        let task = tokio::spawn(async move {
            c.call(Request::new("gone", "ping"), Duration::from_secs(30))
                .await
        });
        requests.recv().await.unwrap();
        assert_eq!(conn.pending_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stress_hundred_concurrent_calls() {
        let addr = echo_peer().await;
        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));

        let calls = (0..100u64).map(|n| {
            let conn = conn.clone();
            async move {
                let resp = conn
                    .call(
                        Request::new("", "ping").with_param("n", n),
                        Duration::from_secs(10),
                    )
                    .await
                    .unwrap();
                (n, resp)
            }
        });

        let results = futures::future::join_all(calls).await;
        assert_eq!(results.len(), 100);
        for (n, resp) in results {
            assert_eq!(resp.status, StatusCode::SUCCESS);
            assert_eq!(resp.data.unwrap()["n"], n);
        }
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().calls, 100);
        assert_eq!(conn.stats().unmatched_responses, 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiting_calls() {
        let (addr, mut requests, _responses) = scripted_peer().await;
        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));

        let c = conn.clone();
        let waiting = tokio::spawn(async move {
            c.call(Request::new("w", "ping"), Duration::from_secs(30))
                .await
        });
        requests.recv().await.unwrap();

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_count(), 0);

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_peer_close_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = Connection::new(ConnectionConfig::new(addr));
        assert_ok!(conn.connect().await);
        wait_until(|| conn.state() == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_undecodable_response_stops_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0, 3]).await.unwrap();
            stream.write_all(b"???").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = Connection::new(ConnectionConfig::new(addr));
        let err = assert_err!(
            conn.call(Request::new("z", "ping"), Duration::from_millis(200))
                .await
        );
        assert!(err.is_timeout());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_failure_disconnects_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // The first socket stays open and unread; later ones echo.
            let (_held, _) = listener.accept().await.unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(echo_stream(stream));
            }
        });

        let conn = Connection::new(ConnectionConfig::new(addr));
        assert_ok!(conn.connect().await);

        // Closing our sending side makes the next frame write fail.
        conn.writer
            .lock()
            .await
            .as_mut()
            .unwrap()
            .shutdown()
            .await
            .unwrap();

        let err = assert_err!(
            conn.call(Request::new("w1", "ping"), Duration::from_secs(5))
                .await
        );
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.is_transport());
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.stats().transport_errors, 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let resp = assert_ok!(
            conn.call(
                Request::new("w2", "ping").with_param("n", 3),
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(resp.id_message, "w2");
        assert_eq!(resp.data.unwrap()["n"], 3);
        assert!(conn.is_connected());
        assert_eq!(conn.stats().transport_errors, 1);
    }

    #[tokio::test]
    async fn test_aborted_writes_never_leave_partial_frame_before_next() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (drained_tx, drained_rx) = oneshot::channel();

        tokio::spawn(async move {
            // First socket: not read until released, so writers block.
            let (mut first, _) = listener.accept().await.unwrap();
            let _ = release_rx.await;
            tokio::spawn(async move {
                let mut decoder = Decoder::new();
                let mut buf = vec![0u8; 64 * 1024];
                let mut frames = 0usize;
                let mut failure = None;
                loop {
                    let n = match first.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    decoder.extend(&buf[..n]);
                    loop {
                        match decoder.decode_request() {
                            Ok(Some(req)) => {
                                assert!(req.id_message.starts_with("big-"));
                                frames += 1;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                failure = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    if failure.is_some() {
                        break;
                    }
                }
                let _ = drained_tx.send((frames, failure));
            });

            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(echo_stream(stream));
            }
        });

        let conn = Arc::new(Connection::new(ConnectionConfig::new(addr)));
        assert_ok!(conn.connect().await);

        let padding = "x".repeat(60_000);
        let tasks: Vec<_> = (0..400)
            .map(|i| {
                let conn = conn.clone();
                let padding = padding.clone();
                tokio::spawn(async move {
                    conn.call(
                        Request::new(format!("big-{}", i), "ping").with_param("padding", padding),
                        Duration::from_secs(30),
                    )
                    .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        // A caller was cut off inside a frame write.
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_count(), 0);
        release_tx.send(()).unwrap();

        let resp = assert_ok!(
            conn.call(
                Request::new("after", "ping").with_param("n", 1),
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(resp.id_message, "after");
        assert_eq!(resp.data.unwrap()["n"], 1);

        let (frames, failure) = tokio::time::timeout(Duration::from_secs(10), drained_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(failure.is_none(), "garbage after partial frame: {:?}", failure);
        assert!(frames < 400);
    }
}
