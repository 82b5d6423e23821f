//! # tierlink-client
//!
//! Outbound client for tierlink tiers.
//!
//! This crate provides:
//! - A persistent TCP connection that multiplexes concurrent calls by message ID
//! - Per-call timeouts with cleanup of abandoned calls
//! - Collision-resistant message ID generation
//! - A typed high-level API for the registered operations

pub mod client;
pub mod connection;
pub mod error;
pub mod id;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig, ConnectionState, StatsSnapshot};
pub use error::ClientError;
pub use id::MessageIdGenerator;
