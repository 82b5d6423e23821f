//! # tierlink-store
//!
//! Account data source for the core tier.
//!
//! This crate provides:
//! - The `AccountStore` lookup trait
//! - An in-memory store loaded from a JSON fixture file

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{AccountStore, MemoryAccountStore};
