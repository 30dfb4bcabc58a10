//! Error types for the gateway core.

use crate::edge::EdgeId;
use edgelink_proto::codec::ProtoError;
use thiserror::Error;

/// Errors that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No edge matches the routing key presented at handshake.
    #[error("no edge found for routing key {routing_key}")]
    EdgeNotFound {
        /// The unmatched routing key.
        routing_key: String,
    },

    /// The presented secret does not match the edge's shared secret.
    #[error("edge credentials mismatch")]
    BadCredentials,

    /// The edge has no connected session.
    #[error("edge {edge_id} is not connected")]
    NotConnected {
        /// The disconnected edge.
        edge_id: EdgeId,
    },

    /// The session is closed or has not completed its handshake.
    #[error("session is not connected")]
    SessionClosed,

    /// A sync is already running on this session.
    #[error("sync already in progress")]
    SyncInProgress,

    /// The bounded high-priority queue rejected a push.
    #[error("high priority queue is full (capacity {capacity})")]
    HighPriorityQueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Event store read/write/commit error.
    #[error("event store error: {msg}")]
    EventStore {
        /// Error message describing the issue.
        msg: String,
    },

    /// A stored event could not be translated to a downlink message.
    #[error("event conversion failed: {msg}")]
    Conversion {
        /// Error message describing the issue.
        msg: String,
    },

    /// An uplink batch failed to dispatch as one unit.
    #[error("uplink dispatch failed: {msg}")]
    UplinkDispatch {
        /// Error message describing the issue.
        msg: String,
    },

    /// Wire-layer error.
    #[error(transparent)]
    Wire(#[from] ProtoError),
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
