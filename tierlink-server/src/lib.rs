//! # tierlink-server
//!
//! Tier server for tierlink.
//!
//! This crate provides:
//! - Inbound listener with per-connection dispatch limits
//! - Operation routing with panic containment
//! - Core, switch and edge operation handlers
//! - Layered configuration (YAML file plus environment overrides)
//! - Prometheus metrics endpoint
//! - REST gateway for the edge tier
//! - Process lifecycle and signal handling

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod router;
pub mod server;

pub use config::{Config, ConfigError, TierRole};
pub use error::ServerError;
pub use gateway::Gateway;
pub use handlers::{core_router, relay_router};
pub use lifecycle::{shutdown_signal, Lifecycle};
pub use metrics::Metrics;
pub use router::{OperationHandler, Router};
pub use server::{Server, ServerConfig, MAX_IN_FLIGHT_PER_CONNECTION};
