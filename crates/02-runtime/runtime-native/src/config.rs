use std::time::Duration;

use shared_channel::{ChannelError, MAX_CAPACITY};

use crate::RuntimeResult;

/// Arena size used for each direction when none is configured.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64 * 1024;
/// How long the host waits for the worker to announce itself.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a native worker and the channels handed to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Thread name, also used as the tracing field `worker`.
    pub name: String,
    /// Arena size of each data channel in bytes.
    pub channel_capacity: usize,
    /// Upper bound on waiting for the worker's `loaded` message.
    pub handshake_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_owned(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Sets the worker thread name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the arena size of each data channel.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets how long to wait for the worker to load.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Rejects settings the channel cannot be built with.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.channel_capacity == 0 || self.channel_capacity > MAX_CAPACITY {
            return Err(ChannelError::CapacityMisconfiguration {
                requested: self.channel_capacity,
                maximum: MAX_CAPACITY,
            }
            .into());
        }
        Ok(())
    }
}
