//! JSON-RPC 2.0 protocol types for provider sessions
//!
//! Self-contained implementation of the JSON-RPC 2.0 subset the tool
//! providers speak, without an external JSON-RPC library. The client
//! sends one request per line over the provider's stdin and reads one
//! response per line from its stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Request parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID
    pub id: RequestId,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: RequestId::Number(id),
        }
    }
}

/// JSON-RPC request ID. The client only ever issues numeric ids, but a
/// provider may echo them back as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// A JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Must be "2.0"
    pub jsonrpc: String,
    /// Result (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// ID of the request this answers
    pub id: RequestId,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Serialize a request as a single wire line (no trailing newline)
pub fn serialize_request(request: &Request) -> Result<String, serde_json::Error> {
    serde_json::to_string(request)
}

/// Parse one newline-delimited response line. Validates the version
/// marker so garbage that happens to be JSON is still rejected.
pub fn parse_response_line(line: &str) -> Result<Response, String> {
    let response: Response =
        serde_json::from_str(line).map_err(|e| format!("parse error: {}", e))?;
    if response.jsonrpc != JSONRPC_VERSION {
        return Err(format!(
            "expected jsonrpc version '{}', got '{}'",
            JSONRPC_VERSION, response.jsonrpc
        ));
    }
    Ok(response)
}
