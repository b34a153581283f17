//! Error types for roomrpc.
//!
//! Local failures (bad target, missing coordinator, unknown handle) are returned
//! by the invocation call itself. Failures that happen on another peer arrive
//! later as the rejection of a [`PendingReply`](crate::PendingReply).

use crate::peer::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for roomrpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Routing errors
    #[error("Peer {peer} is not a live member of the room")]
    InvalidPeer { peer: PeerId },

    #[error("No coordinator is connected to the room")]
    NoCoordinatorConnected,

    // Handler errors
    #[error("Handler '{handler}' is not registered{}", describe_responder(.responder))]
    UnregisteredHandler {
        handler: String,
        /// Peer that reported the handler as missing, if the failure came over the wire.
        responder: Option<PeerId>,
    },

    #[error("Handler '{handler}' is already registered on {topic}")]
    DuplicateHandler { topic: String, handler: String },

    #[error("An exception occurred while executing '{handler}' on peer {responder}; see that peer's log")]
    RemoteExecutionFailure { handler: String, responder: PeerId },

    #[error("Handler '{handler}' failed: {message}")]
    HandlerFailed { handler: String, message: String },

    // Protocol errors
    #[error("Internal protocol error: {message}")]
    InternalProtocol { message: String },

    #[error("Request '{handler}' timed out after {after:?}")]
    Timeout { handler: String, after: Duration },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Channel {topic} closed before a reply arrived")]
    ChannelClosed { topic: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for roomrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

fn describe_responder(responder: &Option<PeerId>) -> String {
    match responder {
        Some(peer) => format!(" on peer {}", peer),
        None => String::new(),
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::InternalProtocol {
            message: message.into(),
        }
    }

    /// Create a validation error for a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a transport error from any message.
    pub fn transport(message: impl Into<String>) -> Self {
        RpcError::Transport {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC style error code.
    ///
    /// Standard codes:
    /// - -32600: Invalid request (validation)
    /// - -32601: Method not found (unregistered handler)
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Invalid peer
    /// - -32002: No coordinator connected
    /// - -32003: Remote execution failure
    /// - -32004: Request timed out
    /// - -32005: Duplicate registration
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Transport { .. } | RpcError::ChannelClosed { .. } | RpcError::Io { .. } => {
                -32000
            }

            RpcError::InvalidPeer { .. } => -32001,
            RpcError::NoCoordinatorConnected => -32002,
            RpcError::RemoteExecutionFailure { .. } => -32003,
            RpcError::Timeout { .. } => -32004,
            RpcError::DuplicateHandler { .. } => -32005,

            RpcError::UnregisteredHandler { .. } => -32601,
            RpcError::Validation { .. } => -32600,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Returns true if the failure was reported by another peer.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            RpcError::RemoteExecutionFailure { .. }
                | RpcError::UnregisteredHandler {
                    responder: Some(_),
                    ..
                }
        )
    }
}
