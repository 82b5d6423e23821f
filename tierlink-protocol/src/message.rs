//! JSON message types for requests and responses.

use crate::error::{ProtocolError, StatusCode};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Operation parameters and result data are always JSON objects.
pub type Params = Map<String, Value>;

/// Operations registered on every tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Ping,
    GetAccountByAccountNumber,
}

impl Operation {
    pub const ALL: [Operation; 2] = [Operation::Ping, Operation::GetAccountByAccountNumber];

    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Ping => "ping",
            Operation::GetAccountByAccountNumber => "get_account_by_account_number",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation: {}", s))
    }
}

/// Request message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation ID. Empty means "assign one before sending".
    #[serde(default)]
    pub id_message: String,

    /// Operation to perform.
    pub operation: String,

    /// Operation-specific parameters.
    #[serde(default)]
    pub params: Params,
}

impl Request {
    pub fn new(id_message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id_message: id_message.into(),
            operation: operation.into(),
            params: Params::new(),
        }
    }

    /// Creates a request without an ID; the sending client assigns one.
    pub fn for_operation(operation: Operation) -> Self {
        Self::new(String::new(), operation.as_str())
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Response message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response correlates to.
    #[serde(default)]
    pub id_message: String,

    /// Three-digit status code.
    pub status: StatusCode,

    /// Human-readable failure cause; empty on success.
    #[serde(default)]
    pub err_info: String,

    /// Result payload (successful responses only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Params>,
}

impl Response {
    pub fn ok(id_message: impl Into<String>, data: Params) -> Self {
        Self {
            id_message: id_message.into(),
            status: StatusCode::SUCCESS,
            err_info: String::new(),
            data: Some(data),
        }
    }

    pub fn error(
        id_message: impl Into<String>,
        status: StatusCode,
        err_info: impl Into<String>,
    ) -> Self {
        Self {
            id_message: id_message.into(),
            status,
            err_info: err_info.into(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// Deserializes the `data` object into a typed result.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .clone()
            .ok_or(ProtocolError::MissingField("data"))?;
        Ok(serde_json::from_value(Value::Object(data))?)
    }
}

/// Converts a serializable value into a JSON object.
pub fn to_params<T: Serialize>(value: &T) -> Result<Params, ProtocolError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Formats a timestamp the way every tier reports times (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Result for `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub message: String,
    pub service: String,
    pub timestamp: String,
}

impl PingResult {
    pub fn pong(service: impl Into<String>) -> Self {
        Self {
            message: "pong".to_string(),
            service: service.into(),
            timestamp: format_timestamp(Utc::now()),
        }
    }
}

/// Parameters for `get_account_by_account_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountParams {
    pub account_number: String,
}

/// Account half of an account lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: i64,
    pub account_number: String,
    pub customer_id: i64,
    pub account_type: String,
    pub account_status: String,
    /// Decimal amount rendered as a string to keep precision.
    pub balance: String,
    pub currency: String,
    pub opened_date: String,
    #[serde(default)]
    pub closed_date: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Customer half of an account lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_number: String,
    pub full_name: String,
    pub id_number: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub date_of_birth: String,
}

/// Result for `get_account_by_account_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLookup {
    pub account: Account,
    pub customer: Customer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new("1", "ping");
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"id_message":"1","operation":"ping","params":{}}"#);
    }

    #[test]
    fn test_request_defaults() {
        let req: Request = serde_json::from_str(r#"{"operation":"ping"}"#).unwrap();
        assert_eq!(req.id_message, "");
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_request_with_param() {
        let req = Request::for_operation(Operation::GetAccountByAccountNumber)
            .with_param("account_number", "1234567890");
        assert_eq!(req.operation, "get_account_by_account_number");
        assert_eq!(req.params["account_number"], "1234567890");
    }

    #[test]
    fn test_response_ok_serialization() {
        let resp = Response::ok("1", to_params(&json!({"message": "pong"})).unwrap());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({"id_message": "1", "status": "000", "err_info": "", "data": {"message": "pong"}})
        );
    }

    #[test]
    fn test_response_error_has_no_data() {
        let resp = Response::error("7", StatusCode::GENERIC_ERROR, "account not found");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":"999""#));
        assert!(!json.contains("data"));
        assert!(resp.is_error());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Ping.as_str(), "ping");
        assert_eq!(
            "get_account_by_account_number".parse::<Operation>().unwrap(),
            Operation::GetAccountByAccountNumber
        );
        assert!("unknown_op".parse::<Operation>().is_err());
    }

    #[test]
    fn test_data_as() {
        let ping = PingResult::pong("core");
        let resp = Response::ok("1", to_params(&ping).unwrap());
        let parsed: PingResult = resp.data_as().unwrap();
        assert_eq!(parsed, ping);

        let err = Response::error("1", StatusCode::GENERIC_ERROR, "boom");
        assert!(matches!(
            err.data_as::<PingResult>(),
            Err(ProtocolError::MissingField("data"))
        ));
    }

    #[test]
    fn test_to_params_rejects_non_objects() {
        assert!(matches!(to_params(&42), Err(ProtocolError::NotAnObject)));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T08:09:10.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(ts), "2024-03-01T08:09:10Z");
    }
}
