//! Error surface for the shared channel.
//!
//! Capacity failures are recoverable and returned to the producer's caller.
//! Protocol violations mean the cursors can no longer be trusted; the thread
//! that observes one should stop and the channel should be rebuilt.

use thiserror::Error;

use crate::header::Generation;

/// Convenience result alias for fallible channel operations.
pub type ChannelResult<T, E = ChannelError> = Result<T, E>;

/// Errors surfaced by the channel and its framing helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The active generation cannot hold the payload right now.
    #[error(
        "not enough space: {requested} bytes requested, {available} free in generation {generation:?}"
    )]
    ChannelFull {
        requested: usize,
        available: usize,
        generation: Generation,
    },

    /// A handshake or cursor invariant was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Requested capacity is zero or does not fit the header encoding.
    #[error("channel capacity {requested} must be between 1 and {maximum} bytes")]
    CapacityMisconfiguration { requested: usize, maximum: usize },

    /// Allocation of the shared region failed for the given size/alignment pair.
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    /// A record read back from the channel does not describe a valid frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Archiving or validating a typed payload failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ChannelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ChannelError::ProtocolViolation(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        ChannelError::Codec(msg.into())
    }

    /// Returns true for failures a caller may retry after the consumer makes progress.
    pub fn is_full(&self) -> bool {
        matches!(self, ChannelError::ChannelFull { .. })
    }
}
