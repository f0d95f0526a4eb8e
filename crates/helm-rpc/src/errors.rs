//! Codec error type and wire error codes.

/// Method does not exist on this side (JSON-RPC standard code).
pub const METHOD_NOT_FOUND: i64 = -32601;
/// An application handler failed while answering an inbound request.
pub const HANDLER_FAILED: i64 = 500;

/// Failure to interpret inbound text as an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Text is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Valid JSON, but not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// Object does not match the request or response shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// Event dispatch named a kind the remote side may not report.
    #[error("unknown event type '{0}'")]
    UnknownEventKind(String),

    /// A required parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),
}
