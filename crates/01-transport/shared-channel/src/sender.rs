//! Producer half of the channel.
//!
//! `send` never blocks: it lands the whole payload in the active generation or
//! fails with [`ChannelError::ChannelFull`] without touching the cursors.
//! After every write, and before computing free space, the producer checks
//! whether generation B could reclaim more of the arena than is left at the
//! tail of generation A and switches when it can.

use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::sync::atomic::Ordering;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

#[cfg(feature = "loom")]
use loom::thread::yield_now;
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

use crate::channel::ChannelMemory;
use crate::header::{Generation, HeaderSnapshot, IDLE, OFFSET_MASK, SEALED};
use crate::{wait, ChannelError, ChannelResult};

/// Yields `send` waits out while the consumer finishes a promotion.
const PROMOTION_SPINS: u32 = 64;

/// Producer half of a [`SharedChannel`](crate::SharedChannel).
pub struct Sender {
    memory: Arc<ChannelMemory>,
}

impl Sender {
    pub(crate) fn new(memory: Arc<ChannelMemory>) -> Self {
        Self { memory }
    }

    /// Arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory.capacity() as usize
    }

    /// Generation new payloads are appended to.
    pub fn active_generation(&self) -> Generation {
        self.memory.header().active()
    }

    /// Current header values.
    pub fn snapshot(&self) -> HeaderSnapshot {
        self.memory.header().snapshot()
    }

    /// Bytes a `send` could place in the active generation right now, without
    /// taking a generation switch into account.
    pub fn free_space(&self) -> usize {
        let header = self.memory.header();
        match header.active() {
            Generation::A => {
                let end = header.gen_a_end.load(Ordering::Relaxed) & OFFSET_MASK;
                self.memory.capacity().saturating_sub(end) as usize
            }
            Generation::B => {
                let end = header.gen_b_end.load(Ordering::Acquire);
                if end == IDLE {
                    return 0;
                }
                let unread = header.unread_start.load(Ordering::Acquire);
                unread.saturating_sub(end) as usize
            }
        }
    }

    /// Appends `payload` to the active generation and wakes the consumer.
    ///
    /// Either every byte lands or the call fails with `ChannelFull` and the
    /// cursors are unchanged. Empty payloads succeed without side effects.
    /// A promotion in flight is waited out for a bounded number of yields.
    pub fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > self.capacity() {
            return Err(self.full(payload.len(), self.free_space()));
        }

        let len = payload.len() as u32;
        let header = self.memory.header();
        let mut promotion_spins = 0;
        loop {
            match header.active() {
                Generation::A => {
                    if self.switch_if_profitable() {
                        continue;
                    }
                    let end = header.gen_a_end.load(Ordering::Relaxed) & OFFSET_MASK;
                    let available = self.memory.capacity() - end;
                    if len > available {
                        return Err(self.full(payload.len(), available as usize));
                    }

                    unsafe {
                        // SAFETY: `[end, end + len)` lies in the tail of generation A,
                        // which the consumer cannot read before the store below.
                        self.memory.write_arena(end, payload);
                    }
                    header.gen_a_end.store(end + len, Ordering::Release);
                    wait::wake_one(&header.gen_a_end);
                    wait::wake_one(&header.unread_start);
                    trace!(offset = end, len, "wrote generation A");

                    self.switch_if_profitable();
                    return Ok(());
                }
                Generation::B => {
                    let end = header.gen_b_end.load(Ordering::Acquire);
                    if end == IDLE {
                        // The consumer is promoting B; the flag flips back shortly.
                        if promotion_spins < PROMOTION_SPINS {
                            promotion_spins += 1;
                            yield_now();
                            continue;
                        }
                        return Err(self.full(payload.len(), 0));
                    }
                    let unread = header.unread_start.load(Ordering::Acquire);
                    let available = unread.saturating_sub(end);
                    if len > available {
                        return Err(self.full(payload.len(), available as usize));
                    }

                    unsafe {
                        // SAFETY: `[end, end + len)` lies below `unread_start`, so the
                        // consumer already copied those bytes out of generation A.
                        self.memory.write_arena(end, payload);
                    }
                    match header.gen_b_end.compare_exchange(
                        end,
                        end + len,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            wait::wake_one(&header.gen_b_end);
                            wait::wake_one(&header.unread_start);
                            trace!(offset = end, len, "wrote generation B");
                            return Ok(());
                        }
                        Err(_) => {
                            debug!("generation B promoted during send, retrying");
                        }
                    }
                }
            }
        }
    }

    /// Parks until a payload of `len` bytes fits in the active generation.
    ///
    /// In generation A the consumer wakes this call whenever it advances
    /// `unread_start`. When it has drained everything but the payload still
    /// does not fit at the tail, the producer switches generations so the
    /// consumer rewinds the arena on its next receive. In generation B the
    /// producer waits for the promotion back to A.
    pub fn wait_for_space(&mut self, len: usize) -> ChannelResult<()> {
        if len > self.capacity() {
            return Err(self.full(len, self.free_space()));
        }

        let len = len as u32;
        let header = self.memory.header();
        loop {
            match header.active() {
                Generation::A => {
                    // Only the producer leaves A, so `unread_start` only grows
                    // until the next switch and is a safe key to park on.
                    let unread = header.unread_start.load(Ordering::Acquire);
                    let a_end = header.gen_a_end.load(Ordering::Relaxed) & OFFSET_MASK;
                    let tail = self.memory.capacity() - a_end;
                    if len <= tail {
                        return Ok(());
                    }

                    let b_end = match header.gen_b_end.load(Ordering::Acquire) {
                        IDLE => 0,
                        end => end,
                    };
                    let drained = unread > 0 && unread == a_end;
                    if unread.saturating_sub(b_end) > tail || drained {
                        self.switch_to_b(a_end, unread);
                        continue;
                    }
                    wait::wait_u32(&header.unread_start, unread);
                }
                Generation::B => {
                    let b_end = header.gen_b_end.load(Ordering::Acquire);
                    if b_end != IDLE {
                        let unread = header.unread_start.load(Ordering::Acquire);
                        if unread.saturating_sub(b_end) >= len {
                            return Ok(());
                        }
                    }
                    // `unread_start` rewinds on promotion, so park on the flag.
                    wait::wait_u32(&header.active_generation, Generation::B as u32);
                }
            }
        }
    }

    fn switch_if_profitable(&self) -> bool {
        let header = self.memory.header();
        let raw_end = header.gen_a_end.load(Ordering::Relaxed);
        if raw_end & SEALED != 0 {
            return false;
        }

        let unread = header.unread_start.load(Ordering::Acquire);
        let b_end = match header.gen_b_end.load(Ordering::Acquire) {
            IDLE => 0,
            end => end,
        };
        let reclaimable = unread.saturating_sub(b_end);
        let tail = self.memory.capacity() - raw_end;
        if reclaimable <= tail {
            return false;
        }

        self.switch_to_b(raw_end, unread);
        true
    }

    fn switch_to_b(&self, a_end: u32, unread: u32) {
        let header = self.memory.header();
        header.gen_b_end.store(0, Ordering::Relaxed);
        header
            .active_generation
            .store(Generation::B as u32, Ordering::Release);
        header.gen_a_end.store(a_end | SEALED, Ordering::Release);
        wait::wake_one(&header.gen_a_end);
        debug!(a_end, unread, "switched to generation B");
    }

    fn full(&self, requested: usize, available: usize) -> ChannelError {
        ChannelError::ChannelFull {
            requested,
            available,
            generation: self.active_generation(),
        }
    }
}
