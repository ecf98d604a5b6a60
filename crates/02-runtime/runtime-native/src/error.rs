use std::time::Duration;

use shared_channel::ChannelError;
use thiserror::Error;

/// Result alias for host and worker operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failures raised while bootstrapping or driving a worker.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The data channel rejected an operation.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A control message arrived out of order or carried an unknown tag.
    #[error("bootstrap protocol violation: {0}")]
    Protocol(String),

    /// The other side dropped its end of the control channel.
    #[error("control channel disconnected: {0}")]
    Disconnected(&'static str),

    /// The worker did not reach a handshake stage in time.
    #[error("timed out after {after:?} waiting for {stage}")]
    Timeout {
        /// Handshake stage that was being awaited.
        stage: &'static str,
        /// Configured timeout.
        after: Duration,
    },

    /// The interpreter loop returned an error.
    #[error("interpreter failed: {0}")]
    Interpreter(String),

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,

    /// The operating system refused to start the worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RuntimeError {
    /// Builds a [`RuntimeError::Protocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        RuntimeError::Protocol(msg.into())
    }

    /// Builds a [`RuntimeError::Interpreter`].
    pub fn interpreter(msg: impl Into<String>) -> Self {
        RuntimeError::Interpreter(msg.into())
    }
}
