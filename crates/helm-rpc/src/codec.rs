//! Inbound classification and payload decoding.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::errors::CodecError;
use crate::types::{RequestEnvelope, ResponseEnvelope};

/// A parsed inbound text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Carries a `method`: an event dispatch or a custom request from the agent.
    Request(RequestEnvelope),
    /// No `method`: the answer to a call the broker issued.
    Response(ResponseEnvelope),
}

impl Inbound {
    /// Classify and parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text).map_err(CodecError::InvalidJson)?;
        let Value::Object(map) = &value else {
            return Err(CodecError::NotAnObject);
        };

        if map.contains_key("method") {
            serde_json::from_value(value)
                .map(Inbound::Request)
                .map_err(CodecError::Malformed)
        } else {
            serde_json::from_value(value)
                .map(Inbound::Response)
                .map_err(CodecError::Malformed)
        }
    }
}

/// Serialize an envelope to its wire text.
pub fn encode<T: Serialize>(envelope: &T) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::Encode)
}

/// Decode a response payload into `T`.
///
/// An absent result is decoded as `null`. When the payload does not fit `T`
/// the supplied `default` is returned instead (which may itself be `None`).
pub fn decode_result<T: DeserializeOwned>(result: Option<Value>, default: Option<T>) -> Option<T> {
    match serde_json::from_value::<T>(result.unwrap_or(Value::Null)) {
        Ok(value) => Some(value),
        Err(error) => {
            trace!(
                %error,
                target_type = std::any::type_name::<T>(),
                "result does not match requested shape, using default"
            );
            default
        }
    }
}
