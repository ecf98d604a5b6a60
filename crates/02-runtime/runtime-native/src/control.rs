//! Control messages exchanged beside the data channels.
//!
//! The bootstrap conversation is always:
//!
//! ```text
//! worker -> host   loaded
//! host   -> worker set_channel_buffers { buffers }
//! host   -> worker run { source? }        (repeatable)
//! ```

use std::fmt;

use shared_channel::SharedChannel;

use crate::{RuntimeError, RuntimeResult};

/// Wire name of a control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlTag {
    /// Worker runtime is initialised.
    Loaded,
    /// Host hands over the shared channel memory.
    SetChannelBuffers,
    /// Host starts the interpreter loop.
    Run,
}

impl ControlTag {
    /// Parses a wire tag; unknown tags are protocol violations.
    pub fn parse(tag: &str) -> RuntimeResult<Self> {
        match tag {
            "loaded" => Ok(ControlTag::Loaded),
            "set_channel_buffers" => Ok(ControlTag::SetChannelBuffers),
            "run" => Ok(ControlTag::Run),
            other => Err(RuntimeError::protocol(format!(
                "unknown control message tag {other:?}"
            ))),
        }
    }

    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlTag::Loaded => "loaded",
            ControlTag::SetChannelBuffers => "set_channel_buffers",
            ControlTag::Run => "run",
        }
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared memory for both data directions.
#[derive(Clone, Debug)]
pub struct ChannelBuffers {
    /// Host produces, worker consumes.
    pub to_worker: SharedChannel,
    /// Worker produces, host consumes.
    pub from_worker: SharedChannel,
}

/// A control message.
#[derive(Clone, Debug)]
pub enum ControlMessage {
    /// Sent once by the worker after start-up.
    Loaded,
    /// Sent once by the host after `Loaded`.
    SetChannelBuffers {
        /// Channel memory the worker attaches to.
        buffers: ChannelBuffers,
    },
    /// Starts (or restarts) the interpreter loop.
    Run {
        /// Optional script handed to the interpreter.
        source: Option<String>,
    },
}

impl ControlMessage {
    /// Tag identifying the message on the wire.
    pub fn tag(&self) -> ControlTag {
        match self {
            ControlMessage::Loaded => ControlTag::Loaded,
            ControlMessage::SetChannelBuffers { .. } => ControlTag::SetChannelBuffers,
            ControlMessage::Run { .. } => ControlTag::Run,
        }
    }
}
