//! Header layout shared by both ends of the channel.
//!
//! ```text
//! +--------------+-----------+-----------+-------------------+
//! | unread_start | gen_a_end | gen_b_end | active_generation |
//! +--------------+-----------+-----------+-------------------+
//!   u32 @0         u32 @4      u32 @8      u32 @12
//! ```
//!
//! Writers per phase:
//! * `unread_start` – consumer only.
//! * `gen_a_end` – producer while generation A is unsealed; consumer while it
//!   promotes generation B.
//! * `gen_b_end` – producer while generation B is active; consumer when it
//!   freezes B for promotion.
//! * `active_generation` – producer for A→B, consumer for B→A.
//!
//! Bit 31 of `gen_a_end` seals generation A once the producer moved to B. The
//! consumer parks on `gen_a_end`, so the seal doubles as the wakeup for a
//! switch.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
use std::mem::size_of;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

/// Seal bit stored in `gen_a_end` after the producer switched to generation B.
pub(crate) const SEALED: u32 = 1 << 31;
/// Mask extracting the offset part of `gen_a_end`.
pub(crate) const OFFSET_MASK: u32 = SEALED - 1;
/// `gen_b_end` value while generation B is frozen or unused.
pub(crate) const IDLE: u32 = u32::MAX;

/// Largest arena the header can address.
pub const MAX_CAPACITY: usize = OFFSET_MASK as usize;
/// Size of the header region in bytes.
pub const HEADER_BYTES: usize = size_of::<ChannelHeader>();

/// Write epoch the producer currently appends to.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Generation {
    A = 0,
    B = 1,
}

impl Generation {
    pub(crate) fn from_raw(raw: u32) -> Self {
        if raw == Generation::B as u32 {
            Generation::B
        } else {
            Generation::A
        }
    }
}

#[repr(C, align(16))]
pub(crate) struct ChannelHeader {
    pub(crate) unread_start: AtomicU32,
    pub(crate) gen_a_end: AtomicU32,
    pub(crate) gen_b_end: AtomicU32,
    pub(crate) active_generation: AtomicU32,
}

impl ChannelHeader {
    pub(crate) fn new() -> Self {
        Self {
            unread_start: AtomicU32::new(0),
            gen_a_end: AtomicU32::new(0),
            gen_b_end: AtomicU32::new(0),
            active_generation: AtomicU32::new(Generation::A as u32),
        }
    }

    pub(crate) fn active(&self) -> Generation {
        Generation::from_raw(self.active_generation.load(Ordering::Acquire))
    }

    pub(crate) fn snapshot(&self) -> HeaderSnapshot {
        let unread_start = self.unread_start.load(Ordering::Acquire);
        let raw_a_end = self.gen_a_end.load(Ordering::Acquire);
        let raw_b_end = self.gen_b_end.load(Ordering::Acquire);
        let active = self.active();
        HeaderSnapshot {
            unread_start,
            gen_a_end: raw_a_end & OFFSET_MASK,
            gen_b_end: if raw_b_end == IDLE { 0 } else { raw_b_end },
            active,
            sealed: raw_a_end & SEALED != 0,
        }
    }
}

/// Point-in-time copy of the header, for diagnostics and tests.
///
/// The four loads are independent, so a snapshot taken while both ends are
/// running may mix values from different moments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderSnapshot {
    /// Offset up to which the consumer has drained generation A.
    pub unread_start: u32,
    /// End of generation A, without the seal bit.
    pub gen_a_end: u32,
    /// End of generation B; 0 while B is idle.
    pub gen_b_end: u32,
    /// Generation the producer appends to.
    pub active: Generation,
    /// True once the producer stopped writing generation A.
    pub sealed: bool,
}

impl HeaderSnapshot {
    /// Bytes written to generation A that the consumer has not read yet.
    pub fn unread_in_a(&self) -> u32 {
        self.gen_a_end.saturating_sub(self.unread_start)
    }
}
