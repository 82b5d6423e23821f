//! tierlink - edge/switch/core relay tier
//!
//! One binary runs any tier; the role comes from configuration.

use std::sync::Arc;
use tierlink_client::{Connection, ConnectionConfig};
use tierlink_server::gateway::serve_gateway;
use tierlink_server::metrics::serve_metrics;
use tierlink_server::{
    core_router, relay_router, shutdown_signal, Config, Gateway, Lifecycle, Metrics, Server,
    ServerConfig,
};
use tierlink_store::{AccountStore, MemoryAccountStore};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then TIERLINK_CONFIG, then environment overrides
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    let service = config.service_name();
    tracing::info!("Starting {} ({} tier)", service, config.tier.role);
    tracing::info!("  Bind address: {}", config.bind_addr());
    tracing::info!(
        "  Limits: {} connections, {} in flight per connection",
        config.network.max_connections,
        config.network.max_in_flight_per_connection
    );

    let mut downstream = None;
    let router = match config.downstream.addr() {
        Some(addr) if config.tier.role.has_downstream() => {
            tracing::info!(
                "  Downstream: {} (request timeout {:?})",
                addr,
                config.downstream.request_timeout()
            );
            let conn = Arc::new(Connection::new(
                ConnectionConfig::new(addr)
                    .with_connect_timeout(config.downstream.connect_timeout())
                    .with_request_timeout(config.downstream.request_timeout()),
            ));
            // Connect eagerly so a misconfigured chain shows up at startup;
            // calls reconnect lazily either way.
            if let Err(e) = conn.connect().await {
                tracing::warn!("Downstream {} not reachable yet: {}", addr, e);
            }
            downstream = Some(conn.clone());
            relay_router(&service, conn, config.downstream.request_timeout())
        }
        _ => {
            let store: Arc<dyn AccountStore> = match config.store.accounts_file {
                Some(ref path) => Arc::new(MemoryAccountStore::load_from_file(path)?),
                None => {
                    tracing::warn!("  No accounts file configured, store is empty");
                    Arc::new(MemoryAccountStore::new())
                }
            };
            tracing::info!("  Accounts: {}", store.len());
            core_router(&service, store)
        }
    };

    let mut server_config = ServerConfig::from_config(&config);
    // Stops the metrics endpoint and the HTTP gateway together.
    let (http_shutdown, _) = broadcast::channel(1);
    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let bind = config.metrics.bind_addr;
        let rx = http_shutdown.subscribe();
        let scrape_downstream = downstream.clone();
        let served = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(bind, served, scrape_downstream, rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
        server_config = server_config.with_metrics(metrics);
        tracing::info!("  Metrics: enabled on {}", bind);
    } else {
        tracing::info!("  Metrics: disabled");
    }

    match downstream.clone() {
        Some(conn) if config.http.enabled => {
            let bind = config.http.bind_addr;
            let rx = http_shutdown.subscribe();
            let gateway = Gateway::new(service.as_str(), conn);
            tokio::spawn(async move {
                if let Err(e) = serve_gateway(bind, gateway, rx).await {
                    tracing::error!("HTTP gateway error: {}", e);
                }
            });
            tracing::info!("  HTTP gateway: enabled on {}", bind);
        }
        _ => tracing::info!("  HTTP gateway: disabled"),
    }

    let listener = TcpListener::bind(server_config.bind_addr).await?;
    let server = Arc::new(Server::new(server_config, router));

    let mut lifecycle = Lifecycle::new(server);
    if let Some(conn) = downstream {
        lifecycle = lifecycle.with_downstream(conn);
    }
    lifecycle = lifecycle.with_http_shutdown(http_shutdown);

    lifecycle.run_until(listener, shutdown_signal()).await?;
    Ok(())
}
