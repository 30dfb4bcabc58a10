//! Frame codec for session link messages.
//!
//! Frames are bincode-encoded. Inbound decode enforces the configured
//! maximum message size before deserializing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Inbound frame exceeds the configured size limit.
    #[error("frame of {size} bytes exceeds max inbound message size {max}")]
    FrameTooLarge {
        /// Size of the rejected frame in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// Frame encode/decode error.
    #[error("frame codec error")]
    Codec(#[from] bincode::Error),

    /// The session link is closed.
    #[error("session link closed")]
    LinkClosed,
}

/// Result alias for wire-layer operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Encode a message into a wire frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a wire frame, rejecting frames over `max_size` bytes.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8], max_size: usize) -> Result<T> {
    if frame.len() > max_size {
        return Err(ProtoError::FrameTooLarge {
            size: frame.len(),
            max: max_size,
        });
    }
    Ok(bincode::deserialize(frame)?)
}
