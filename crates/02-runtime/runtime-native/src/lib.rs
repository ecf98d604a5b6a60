#![deny(missing_docs)]
//! Native host for a worker thread fed through shared channels.
//!
//! The host and the worker agree on the channel memory with a small control
//! conversation (`loaded`, `set_channel_buffers`, `run`) carried over
//! `crossbeam-channel`; payloads then travel through two
//! [`shared_channel::SharedChannel`]s, one per direction.

mod config;
mod control;
mod error;
mod handshake;
mod worker;

pub use config::{WorkerConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_HANDSHAKE_TIMEOUT};
pub use control::{ChannelBuffers, ControlMessage, ControlTag};
pub use error::{RuntimeError, RuntimeResult};
pub use handshake::{HostHandshake, HostState, WorkerHandshake, WorkerState, WorkerStep};
pub use worker::{EchoInterpreter, Interpreter, WorkerHost, WorkerIo, WorkerStatus, SHUTDOWN_TAG};
