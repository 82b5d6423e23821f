//! Process lifecycle: run until a shutdown trigger, then tear down in order.

use crate::error::ServerError;
use crate::server::Server;
use std::future::Future;
use std::sync::Arc;
use tierlink_client::Connection;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Owns everything a tier process has to stop on shutdown.
pub struct Lifecycle {
    server: Arc<Server>,
    downstream: Option<Arc<Connection>>,
    http_shutdown: Option<broadcast::Sender<()>>,
}

impl Lifecycle {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            downstream: None,
            http_shutdown: None,
        }
    }

    /// Sets the downstream connection closed on shutdown.
    pub fn with_downstream(mut self, downstream: Arc<Connection>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    /// Sets the sender that stops the metrics endpoint and the HTTP gateway.
    pub fn with_http_shutdown(mut self, tx: broadcast::Sender<()>) -> Self {
        self.http_shutdown = Some(tx);
        self
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Serves `listener` until `signal` resolves, then shuts everything down.
    ///
    /// Requests still in flight when the signal fires are not waited for.
    pub async fn run_until<F>(&self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let server = self.server.clone();
        let run = server.run_with_listener(listener);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = signal => {
                tracing::info!("Received shutdown signal, stopping server...");
                self.server.shutdown();
                run.await
            }
        };

        self.shutdown().await;
        tracing::info!("Server stopped");
        result
    }

    /// Stops the server, the HTTP listeners and the downstream client.
    pub async fn shutdown(&self) {
        self.server.shutdown();
        if let Some(ref tx) = self.http_shutdown {
            let _ = tx.send(());
        }
        if let Some(ref downstream) = self.downstream {
            tracing::info!("Closing downstream connection to {}", downstream.config().addr);
            downstream.disconnect().await;
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
