//! Agent event kinds and their wire form.
//!
//! An agent reports lifecycle changes with an `onEvent` call whose parameter
//! object names the kind in `eventType`. Free-form requests arrive as
//! `sendCustomRequest` calls and expect a response under their own id.
//! `Disconnected` and `Reconnected` are never sent by agents; the broker
//! synthesizes them from transport state.

use std::fmt;

use helm_core::CallToken;
use serde_json::Value;

use crate::errors::CodecError;
use crate::types::RequestEnvelope;

/// Method an agent uses to report an event.
pub const EVENT_DISPATCH_METHOD: &str = "onEvent";
/// Method an agent uses for a request that needs an answer.
pub const CUSTOM_REQUEST_METHOD: &str = "sendCustomRequest";

/// Listener registration key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The agent's script stopped.
    ScriptEnded,
    /// The agent's account was banned.
    Banned,
    /// Free-form text message from the script.
    Custom,
    /// Free-form request expecting a reply.
    CustomRequest,
    /// The transport closed.
    Disconnected,
    /// The same agent came back within the grace window.
    Reconnected,
}

impl EventKind {
    /// Every kind.
    pub const ALL: [EventKind; 6] = [
        EventKind::ScriptEnded,
        EventKind::Banned,
        EventKind::Custom,
        EventKind::CustomRequest,
        EventKind::Disconnected,
        EventKind::Reconnected,
    ];

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Self::ScriptEnded => "scriptEnded",
            Self::Banned => "banned",
            Self::Custom => "custom",
            Self::CustomRequest => "sendCustomRequest",
            Self::Disconnected => "disconnected",
            Self::Reconnected => "reconnected",
        }
    }

    /// Look a kind up by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Whether the broker produces this kind itself rather than receiving it.
    pub fn is_synthetic(self) -> bool {
        matches!(self, Self::Disconnected | Self::Reconnected)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event delivered to listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// The agent's script stopped.
    ScriptEnded,
    /// The agent's account was banned.
    Banned,
    /// Free-form text message.
    Custom {
        /// Message body.
        message: String,
    },
    /// Free-form request; answer with a response carrying `token`.
    CustomRequest {
        /// Request body.
        request: String,
        /// Id to echo in the response.
        token: CallToken,
    },
    /// The transport closed.
    Disconnected,
    /// The agent reconnected within the grace window.
    Reconnected,
}

impl AgentEvent {
    /// Kind used to select listeners.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ScriptEnded => EventKind::ScriptEnded,
            Self::Banned => EventKind::Banned,
            Self::Custom { .. } => EventKind::Custom,
            Self::CustomRequest { .. } => EventKind::CustomRequest,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnected => EventKind::Reconnected,
        }
    }

    /// Decode the parameter of an `onEvent` call.
    ///
    /// Accepts either the parameter object itself or a one-element array
    /// wrapping it.
    pub fn from_dispatch(params: Option<&Value>) -> Result<Self, CodecError> {
        let object = match params {
            Some(Value::Array(items)) => items.first(),
            other => other,
        }
        .and_then(Value::as_object)
        .ok_or(CodecError::MissingParam("eventType"))?;

        let name = object
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingParam("eventType"))?;

        match EventKind::from_name(name).filter(|kind| !kind.is_synthetic()) {
            Some(EventKind::ScriptEnded) => Ok(Self::ScriptEnded),
            Some(EventKind::Banned) => Ok(Self::Banned),
            Some(EventKind::Custom) => Ok(Self::Custom {
                message: object
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            }),
            _ => Err(CodecError::UnknownEventKind(name.to_owned())),
        }
    }

    /// Decode a `sendCustomRequest` call. The request body is the first
    /// positional parameter; the envelope id becomes the reply token.
    pub fn from_custom_request(request: &RequestEnvelope) -> Result<Self, CodecError> {
        let body = match request.param(0) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => return Err(CodecError::MissingParam("request")),
            Some(other) => other.to_string(),
        };
        Ok(Self::CustomRequest {
            request: body,
            token: request.id.clone(),
        })
    }
}
