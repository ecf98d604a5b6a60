//! Ordering rules for the bootstrap conversation.
//!
//! Both sides track where they are and refuse messages that arrive out of
//! order. A violation is fatal: the worker and its channels must be rebuilt.

use tracing::{debug, warn};

use crate::control::{ChannelBuffers, ControlMessage, ControlTag};
use crate::{RuntimeError, RuntimeResult};

/// Host-side bootstrap progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    /// Waiting for the worker's `loaded`.
    AwaitingLoaded,
    /// The worker is up; buffers not sent yet.
    Loaded,
    /// Buffers handed over; the worker can run.
    Ready,
    /// At least one `run` was sent.
    Running,
}

/// Host-side handshake state machine.
#[derive(Debug)]
pub struct HostHandshake {
    state: HostState,
}

impl Default for HostHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl HostHandshake {
    /// Starts in [`HostState::AwaitingLoaded`].
    pub fn new() -> Self {
        Self {
            state: HostState::AwaitingLoaded,
        }
    }

    /// Current state.
    pub fn state(&self) -> HostState {
        self.state
    }

    /// Applies a message received from the worker.
    pub fn receive(&mut self, message: &ControlMessage) -> RuntimeResult<()> {
        self.accept(message.tag())
    }

    /// Replays one step of a transcript by tag, in whichever direction the
    /// tag travels, and returns the resulting state.
    pub fn apply(&mut self, tag: ControlTag) -> RuntimeResult<HostState> {
        match tag {
            ControlTag::Loaded => self.accept(tag)?,
            ControlTag::SetChannelBuffers => self.send_buffers()?,
            ControlTag::Run => self.send_run()?,
        }
        Ok(self.state)
    }

    fn accept(&mut self, tag: ControlTag) -> RuntimeResult<()> {
        match (self.state, tag) {
            (HostState::AwaitingLoaded, ControlTag::Loaded) => {
                self.state = HostState::Loaded;
                debug!("worker loaded");
                Ok(())
            }
            (state, tag) => Err(violation(format!(
                "host received {tag} while {state:?}"
            ))),
        }
    }

    /// Records that buffers are about to be sent.
    pub fn send_buffers(&mut self) -> RuntimeResult<()> {
        match self.state {
            HostState::Loaded => {
                self.state = HostState::Ready;
                debug!("channel buffers sent");
                Ok(())
            }
            HostState::AwaitingLoaded => Err(violation(
                "channel buffers sent before the worker loaded",
            )),
            HostState::Ready | HostState::Running => {
                Err(violation("channel buffers have already been set"))
            }
        }
    }

    /// Records that a `run` is about to be sent.
    pub fn send_run(&mut self) -> RuntimeResult<()> {
        match self.state {
            HostState::Ready | HostState::Running => {
                self.state = HostState::Running;
                Ok(())
            }
            state => Err(violation(format!("run requested while {state:?}"))),
        }
    }
}

/// Worker-side bootstrap progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Runtime still initialising.
    Booting,
    /// `loaded` sent; waiting for buffers.
    Loaded,
    /// Buffers attached; waiting for `run`.
    Ready,
}

/// What the worker should do after accepting a message.
#[derive(Debug)]
pub enum WorkerStep {
    /// Attach to the channel memory.
    Attach(ChannelBuffers),
    /// Run the interpreter with the given source.
    Run(Option<String>),
}

/// Worker-side handshake state machine.
#[derive(Debug)]
pub struct WorkerHandshake {
    state: WorkerState,
}

impl Default for WorkerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandshake {
    /// Starts in [`WorkerState::Booting`].
    pub fn new() -> Self {
        Self {
            state: WorkerState::Booting,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Produces the `loaded` announcement. Only valid once.
    pub fn announce_loaded(&mut self) -> RuntimeResult<ControlMessage> {
        if self.state != WorkerState::Booting {
            return Err(violation("worker already announced itself"));
        }
        self.state = WorkerState::Loaded;
        Ok(ControlMessage::Loaded)
    }

    /// Applies a message received from the host.
    pub fn receive(&mut self, message: ControlMessage) -> RuntimeResult<WorkerStep> {
        match (self.state, message) {
            (WorkerState::Loaded, ControlMessage::SetChannelBuffers { buffers }) => {
                self.state = WorkerState::Ready;
                debug!("worker attached channel buffers");
                Ok(WorkerStep::Attach(buffers))
            }
            (WorkerState::Ready, ControlMessage::SetChannelBuffers { .. }) => {
                Err(violation("channel buffers have already been set"))
            }
            (WorkerState::Ready, ControlMessage::Run { source }) => Ok(WorkerStep::Run(source)),
            (state, message) => Err(violation(format!(
                "worker received {} while {state:?}",
                message.tag()
            ))),
        }
    }
}

fn violation(msg: impl Into<String>) -> RuntimeError {
    let msg = msg.into();
    warn!(%msg, "bootstrap handshake violated");
    RuntimeError::Protocol(msg)
}
