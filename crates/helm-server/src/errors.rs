//! Broker error type.
//!
//! One variant per caller-visible failure kind. A result that cannot be
//! decoded into the requested shape is not an error; see
//! [`helm_rpc::decode_result`].

use std::time::Duration;

use helm_core::ConnectionId;
use helm_rpc::{CodecError, RpcErrorObject};
use serde_json::Value;

/// Errors returned by broker and server operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No live transport for the connection.
    #[error("connection '{0}' is not connected")]
    NotConnected(ConnectionId),

    /// No response arrived within the bound.
    #[error("no response to '{method}' within {timeout:?}")]
    Timeout {
        /// Method that was called.
        method: String,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// The agent answered with an error payload.
    #[error("remote error [{code}]: {message}")]
    Remote {
        /// Remote error code.
        code: i64,
        /// Remote error message.
        message: String,
        /// Auxiliary remote data.
        data: Option<Value>,
    },

    /// A second transport claimed an id that is already live.
    #[error("connection '{0}' is already live")]
    DuplicateConnection(ConnectionId),

    /// The connection's outbound queue is full or closed.
    #[error("failed to enqueue message for '{0}'")]
    Transport(ConnectionId),

    /// The broker no longer accepts connections.
    #[error("broker is shutting down")]
    ShuttingDown,

    /// An expected connection did not arrive in time.
    #[error("connection '{id}' did not connect within {timeout:?}")]
    ConnectTimeout {
        /// Expected connection id.
        id: ConnectionId,
        /// Bound that elapsed.
        timeout: Duration,
    },

    /// An envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] CodecError),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The public address lookup failed.
    #[error("public address lookup failed: {0}")]
    AddressLookup(String),
}

impl From<RpcErrorObject> for BrokerError {
    fn from(error: RpcErrorObject) -> Self {
        Self::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BrokerError>;
