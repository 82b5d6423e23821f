//! # tierlink-protocol
//!
//! Wire protocol shared by every tierlink tier.
//!
//! This crate provides:
//! - Binary framing with a 2-byte big-endian length prefix
//! - A buffered decoder for partial socket reads
//! - JSON request/response envelopes
//! - Three-digit status codes and operation payload types

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{ProtocolError, StatusCode};
pub use frame::{decode_length, Frame, LENGTH_PREFIX_SIZE};
pub use message::{Operation, Params, Request, Response};

/// Maximum frame payload size (the largest value a `u16` prefix can carry).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Default port of the edge tier.
pub const DEFAULT_EDGE_PORT: u16 = 5000;

/// Default port of the core tier.
pub const DEFAULT_CORE_PORT: u16 = 5001;

/// Default port of the switch tier.
pub const DEFAULT_SWITCH_PORT: u16 = 5002;
