//! # helm-rpc
//!
//! Wire layer between the broker and its agents:
//!
//! - Envelopes: [`RequestEnvelope`], [`ResponseEnvelope`], [`RpcErrorObject`]
//! - Classification of inbound text into calls/events vs. responses ([`Inbound`])
//! - Tolerant decoding of a response payload into a caller-chosen shape ([`decode_result`])
//! - The closed set of agent events ([`AgentEvent`], [`EventKind`])

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod events;
pub mod types;

pub use codec::{Inbound, decode_result, encode};
pub use errors::CodecError;
pub use events::{AgentEvent, EventKind};
pub use types::{JSONRPC_VERSION, RequestEnvelope, ResponseEnvelope, RpcErrorObject};
