//! Wire envelopes.
//!
//! ```text
//! request:  { "jsonrpc": "2.0", "id": <token>, "method": <string>, "params": <array>? }
//! response: { "jsonrpc": "2.0", "id": <token>, "result": <any>?, "error": {code, message, data?}? }
//! ```
//!
//! Inbound `id` values may be JSON strings or numbers; numbers are kept as
//! their decimal text so they echo back unchanged in meaning.

use std::fmt;

use helm_core::CallToken;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

fn token_from_string_or_number<'de, D>(deserializer: D) -> Result<CallToken, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => CallToken::from(s),
        RawId::Num(n) => CallToken::from(n.to_string()),
    })
}

/// A call in either direction: broker → agent request, or agent → broker
/// event dispatch / custom request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Protocol version tag.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Correlation token.
    #[serde(deserialize_with = "token_from_string_or_number")]
    pub id: CallToken,
    /// Method name.
    pub method: String,
    /// Positional parameters; omitted when there are none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestEnvelope {
    /// Build a request. An empty parameter list is sent as an absent `params`.
    pub fn new(id: CallToken, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: method.into(),
            params: (!params.is_empty()).then_some(Value::Array(params)),
        }
    }

    /// Positional parameter at `index`, if `params` is an array.
    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.as_ref()?.as_array()?.get(index)
    }
}

/// Reply to a prior request, matched by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Protocol version tag.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Token of the request being answered.
    #[serde(deserialize_with = "token_from_string_or_number")]
    pub id: CallToken,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload. Takes precedence over `result` when both are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl ResponseEnvelope {
    /// Build a success response. A `null` result is omitted on the wire.
    pub fn success(id: CallToken, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: (!result.is_null()).then_some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: CallToken, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Structured error inside a [`ResponseEnvelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Auxiliary structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Create an error without auxiliary data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach auxiliary data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " {data}")?;
        }
        Ok(())
    }
}
