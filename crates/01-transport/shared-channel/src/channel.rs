//! Channel construction and the shareable handle handed to both threads.
//!
//! Layout of the single allocation:
//!
//! ```text
//! +---------------------+------------------------------------+
//! | Header (16 bytes)   | Arena (capacity bytes)             |
//! +---------------------+------------------------------------+
//! ```
//!
//! [`SharedChannel`] is the "buffers" handle of the bootstrap protocol: the
//! host creates it, clones it into the worker, and each side claims exactly one
//! role from it.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::debug;

use crate::header::{ChannelHeader, HeaderSnapshot, HEADER_BYTES, MAX_CAPACITY};
use crate::region::SharedRegion;
use crate::wasm::{ChannelLayout, Region};
use crate::{ChannelError, ChannelResult, Receiver, Sender};

const REGION_ALIGNMENT: usize = 64;

pub(crate) struct ChannelMemory {
    region: SharedRegion,
    capacity: u32,
    sender_claimed: AtomicBool,
    receiver_claimed: AtomicBool,
}

impl ChannelMemory {
    fn allocate(capacity: usize) -> ChannelResult<Self> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(ChannelError::CapacityMisconfiguration {
                requested: capacity,
                maximum: MAX_CAPACITY,
            });
        }

        let region = SharedRegion::new_aligned(HEADER_BYTES + capacity, REGION_ALIGNMENT)?;
        unsafe {
            // SAFETY: the region is at least `HEADER_BYTES` long and 64-byte aligned,
            // which satisfies the header's 16-byte alignment.
            (region.as_ptr() as *mut ChannelHeader).write(ChannelHeader::new());
        }

        Ok(Self {
            region,
            capacity: capacity as u32,
            sender_claimed: AtomicBool::new(false),
            receiver_claimed: AtomicBool::new(false),
        })
    }

    #[cfg(target_arch = "wasm32")]
    fn attach(region: SharedRegion, capacity: u32) -> Self {
        Self {
            region,
            capacity,
            sender_claimed: AtomicBool::new(false),
            receiver_claimed: AtomicBool::new(false),
        }
    }

    pub(crate) fn header(&self) -> &ChannelHeader {
        unsafe {
            // SAFETY: initialised in `allocate` and alive as long as `self`.
            &*(self.region.as_ptr() as *const ChannelHeader)
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Copies `payload` into the arena at `offset`.
    ///
    /// # Safety
    /// `offset + payload.len()` must not exceed the capacity, and the range
    /// must not be readable by the consumer until a cursor store publishes it.
    pub(crate) unsafe fn write_arena(&self, offset: u32, payload: &[u8]) {
        debug_assert!(offset as usize + payload.len() <= self.capacity as usize);
        let dst = self.arena_ptr().add(offset as usize);
        std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, payload.len());
    }

    /// Copies `out.len()` bytes starting at `offset` out of the arena.
    ///
    /// # Safety
    /// The range must lie within the capacity and must have been published by
    /// a cursor store the caller observed with acquire ordering.
    pub(crate) unsafe fn read_arena(&self, offset: u32, out: &mut [u8]) {
        debug_assert!(offset as usize + out.len() <= self.capacity as usize);
        let src = self.arena_ptr().add(offset as usize);
        std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
    }

    fn arena_ptr(&self) -> *mut u8 {
        unsafe {
            // SAFETY: the region spans `HEADER_BYTES + capacity` bytes.
            self.region.as_ptr().add(HEADER_BYTES)
        }
    }

    fn claim(flag: &AtomicBool, role: &str) -> ChannelResult<()> {
        use std::sync::atomic::Ordering;
        if flag.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::protocol(format!(
                "channel {role} has already been claimed"
            )));
        }
        Ok(())
    }
}

/// Cloneable handle to a channel's shared header and arena.
#[derive(Clone)]
pub struct SharedChannel {
    memory: Arc<ChannelMemory>,
}

impl SharedChannel {
    /// Allocates a channel whose arena holds `capacity` bytes.
    pub fn new(capacity: usize) -> ChannelResult<Self> {
        let memory = ChannelMemory::allocate(capacity)?;
        debug!(capacity, "allocated shared channel");
        Ok(Self {
            memory: Arc::new(memory),
        })
    }

    /// Arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory.capacity() as usize
    }

    /// Current header values.
    pub fn snapshot(&self) -> HeaderSnapshot {
        self.memory.header().snapshot()
    }

    /// Offsets of the header and arena relative to the start of the allocation.
    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout {
            header: Region {
                offset: 0,
                length: HEADER_BYTES as u32,
            },
            data: Region {
                offset: HEADER_BYTES as u32,
                length: self.memory.capacity(),
            },
            capacity_bytes: self.memory.capacity(),
        }
    }

    #[cfg(target_arch = "wasm32")]
    /// Attaches to a channel another instance allocated in shared linear memory.
    ///
    /// Role claims are tracked per handle, so the two instances must agree out
    /// of band on which one sends and which one receives.
    ///
    /// # Safety
    /// The layout must describe a live channel created by [`SharedChannel::new`]
    /// whose memory outlives the returned handle.
    pub unsafe fn from_wasm_layout(layout: ChannelLayout) -> ChannelResult<Self> {
        if layout.data.offset != layout.header.offset + HEADER_BYTES as u32
            || layout.data.length != layout.capacity_bytes
        {
            return Err(ChannelError::protocol("channel layout does not match header size"));
        }
        let total = HEADER_BYTES + layout.capacity_bytes as usize;
        let region = SharedRegion::from_linear_memory(layout.header.offset, total, REGION_ALIGNMENT)?;
        Ok(Self {
            memory: Arc::new(ChannelMemory::attach(region, layout.capacity_bytes)),
        })
    }

    #[cfg(target_arch = "wasm32")]
    /// Describes the channel with absolute linear-memory offsets for JS glue.
    pub fn wasm_layout(&self) -> ChannelLayout {
        let base = self.memory.region.as_ptr() as usize as u32;
        let mut layout = self.layout();
        layout.header.offset += base;
        layout.data.offset += base;
        layout
    }

    /// Claims the producer half. Fails if it was already claimed.
    pub fn sender(&self) -> ChannelResult<Sender> {
        ChannelMemory::claim(&self.memory.sender_claimed, "sender")?;
        Ok(Sender::new(Arc::clone(&self.memory)))
    }

    /// Claims the consumer half. Fails if it was already claimed.
    pub fn receiver(&self) -> ChannelResult<Receiver> {
        ChannelMemory::claim(&self.memory.receiver_claimed, "receiver")?;
        Ok(Receiver::new(Arc::clone(&self.memory)))
    }

    /// Claims both halves at once.
    pub fn split(&self) -> ChannelResult<(Sender, Receiver)> {
        Ok((self.sender()?, self.receiver()?))
    }

    /// Returns true when both handles refer to the same allocation.
    pub fn same_channel(&self, other: &SharedChannel) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel")
            .field("capacity", &self.memory.capacity())
            .field("header", &self.snapshot())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::Generation;

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            SharedChannel::new(0).unwrap_err(),
            ChannelError::CapacityMisconfiguration {
                requested: 0,
                maximum: MAX_CAPACITY,
            }
        );
    }

    #[test]
    fn capacity_must_leave_room_for_the_seal_bit() {
        assert!(matches!(
            SharedChannel::new(MAX_CAPACITY + 1),
            Err(ChannelError::CapacityMisconfiguration { .. })
        ));
    }

    #[test]
    fn fresh_channel_starts_in_generation_a() {
        let channel = SharedChannel::new(64).expect("channel");
        let snap = channel.snapshot();
        assert_eq!(snap.unread_start, 0);
        assert_eq!(snap.gen_a_end, 0);
        assert_eq!(snap.gen_b_end, 0);
        assert_eq!(snap.active, Generation::A);
        assert!(!snap.sealed);
    }

    #[test]
    fn layout_places_arena_after_header() {
        let channel = SharedChannel::new(100).expect("channel");
        let layout = channel.layout();
        assert_eq!(layout.header.offset, 0);
        assert_eq!(layout.header.length, 16);
        assert_eq!(layout.data.offset, 16);
        assert_eq!(layout.data.length, 100);
        assert_eq!(layout.capacity_bytes, 100);
    }

    #[test]
    fn each_role_can_be_claimed_once() {
        let channel = SharedChannel::new(32).expect("channel");
        let worker_side = channel.clone();
        assert!(channel.same_channel(&worker_side));

        let _sender = channel.sender().expect("first sender");
        let _receiver = worker_side.receiver().expect("first receiver");

        assert!(matches!(
            worker_side.sender(),
            Err(ChannelError::ProtocolViolation(_))
        ));
        assert!(matches!(
            channel.split(),
            Err(ChannelError::ProtocolViolation(_))
        ));
    }
}
