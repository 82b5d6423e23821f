//! Protocol error types and status codes.

use serde::de::{self, Deserializer, Visitor};
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("oversized payload: {size} bytes (max {max})")]
    OversizedPayload { size: usize, max: usize },

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid status code: {0:?}")]
    InvalidStatus(String),

    #[error("expected a JSON object")]
    NotAnObject,
}

/// Three-digit status code carried in every response.
///
/// `"000"` is success; every other code is a failure. The wire form is
/// always exactly three ASCII digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    /// Request completed successfully.
    pub const SUCCESS: StatusCode = StatusCode(0);
    /// Downstream call dropped before an answer was possible.
    pub const DROPPED: StatusCode = StatusCode(997);
    /// Downstream call timed out.
    pub const TIMEOUT: StatusCode = StatusCode(998);
    /// Generic failure: malformed request, unknown operation, not found,
    /// downstream failure.
    pub const GENERIC_ERROR: StatusCode = StatusCode(999);

    /// Creates a status code, rejecting values above 999.
    pub fn new(code: u16) -> Result<Self, ProtocolError> {
        if code > 999 {
            return Err(ProtocolError::InvalidStatus(code.to_string()));
        }
        Ok(Self(code))
    }

    /// Parses the three-digit wire form.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidStatus(s.to_string()));
        }
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| ProtocolError::InvalidStatus(s.to_string()))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StatusVisitor;

        impl Visitor<'_> for StatusVisitor {
            type Value = StatusCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a three-digit status string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<StatusCode, E> {
                StatusCode::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(StatusVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::SUCCESS.to_string(), "000");
        assert_eq!(StatusCode::GENERIC_ERROR.to_string(), "999");
        assert_eq!(StatusCode::new(42).unwrap().to_string(), "042");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(StatusCode::parse("000").unwrap(), StatusCode::SUCCESS);
        assert_eq!(StatusCode::parse("998").unwrap(), StatusCode::TIMEOUT);
        assert!(StatusCode::parse("0").is_err());
        assert!(StatusCode::parse("1000").is_err());
        assert!(StatusCode::parse("9a9").is_err());
        assert!(StatusCode::new(1000).is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&StatusCode::GENERIC_ERROR).unwrap();
        assert_eq!(json, "\"999\"");

        let parsed: StatusCode = serde_json::from_str("\"000\"").unwrap();
        assert!(parsed.is_success());

        assert!(serde_json::from_str::<StatusCode>("\"ok\"").is_err());
        assert!(serde_json::from_str::<StatusCode>("999").is_err());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::OversizedPayload {
            size: 70000,
            max: 65535,
        };
        assert!(err.to_string().contains("70000"));

        let err = ProtocolError::Truncated { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::MissingField("operation");
        assert!(err.to_string().contains("operation"));
    }
}
