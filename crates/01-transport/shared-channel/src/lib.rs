#![cfg_attr(
    all(target_arch = "wasm32", not(feature = "loom")),
    feature(stdarch_wasm_atomic_wait)
)]
//! Double-buffered single-producer/single-consumer byte channel over shared memory.
//!
//! The crate exposes the pieces a host thread and a blocking worker thread need
//! to exchange variable-length byte payloads without a lock:
//! * [`SharedChannel`] – cloneable handle to the header + arena allocation.
//! * [`Sender`] / [`Receiver`] – the producer and consumer halves of the protocol.
//! * [`HeaderSnapshot`] / [`Generation`] – read-only view of the four header slots.
//! * [`FrameSender`] / [`FrameReceiver`] – optional length-prefixed records on top.
//! * [`ChannelError`] – capacity, protocol and allocation failures.

mod channel;
mod error;
mod frame;
mod header;
mod receiver;
mod region;
mod sender;
pub mod wait;
pub mod wasm;

pub use channel::SharedChannel;
pub use error::{ChannelError, ChannelResult};
pub use frame::{archive, Envelope, Frame, FrameReceiver, FrameSender, FRAME_HEADER_LEN};
pub use header::{Generation, HeaderSnapshot, HEADER_BYTES, MAX_CAPACITY};
pub use receiver::Receiver;
pub use region::SharedRegion;
pub use sender::Sender;
