//! Error types for coordinator-rpc.

use thiserror::Error;

use crate::status::Status;

/// Main error type for transport, dispatch and configuration failures.
///
/// Per-call business outcomes travel as [`Status`] and only become an error on
/// the client side, wrapped in [`CoordinatorError::Status`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Protocol error (invalid frame, wrong flags, duplicate request id, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No method is registered under the given id.
    #[error("Unknown method ID: {0}")]
    UnknownMethod(u16),

    /// A completion tag was consumed twice or never existed.
    #[error("stale or unknown completion tag {0}")]
    StaleTag(crate::tag::Tag),

    /// A call slot was asked to make a transition its current state forbids.
    #[error("call slot {slot}: {transition} not allowed in state {state:?}")]
    SlotState {
        slot: u64,
        transition: &'static str,
        state: crate::slot::SlotState,
    },

    /// The transport reported a registered operation as failed.
    #[error("completion tag {0} reported failure")]
    FailedEvent(crate::tag::Tag),

    /// The completion queue no longer accepts events.
    #[error("completion queue is shut down")]
    QueueShutdown,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The server answered the call with a non-OK status.
    #[error("call failed: {0}")]
    Status(Status),
}

/// Result type alias using CoordinatorError.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
