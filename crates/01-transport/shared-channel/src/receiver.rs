//! Consumer half of the channel.
//!
//! The consumer always drains generation A from `unread_start` to `gen_a_end`.
//! Once A is sealed and fully drained it promotes generation B: the bytes the
//! producer wrote at the front of the arena become the new generation A and
//! the producer goes back to appending after them.

use std::sync::Arc;

#[cfg(feature = "loom")]
use loom::sync::atomic::Ordering;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::Ordering;

use tracing::{debug, error, trace};

use crate::channel::ChannelMemory;
use crate::header::{Generation, HeaderSnapshot, IDLE, OFFSET_MASK, SEALED};
use crate::{wait, ChannelError, ChannelResult};

enum Visible {
    Span { start: u32, end: u32 },
    Empty { raw_end: u32 },
}

/// Consumer half of a [`SharedChannel`](crate::SharedChannel).
pub struct Receiver {
    memory: Arc<ChannelMemory>,
}

impl Receiver {
    pub(crate) fn new(memory: Arc<ChannelMemory>) -> Self {
        Self { memory }
    }

    /// Arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory.capacity() as usize
    }

    /// Current header values.
    pub fn snapshot(&self) -> HeaderSnapshot {
        self.memory.header().snapshot()
    }

    /// Unread bytes visible in generation A.
    pub fn available(&self) -> usize {
        let header = self.memory.header();
        let end = header.gen_a_end.load(Ordering::Acquire) & OFFSET_MASK;
        let start = header.unread_start.load(Ordering::Relaxed);
        end.saturating_sub(start) as usize
    }

    /// Copies out every visible unread byte without blocking.
    pub fn try_recv(&mut self) -> ChannelResult<Option<Vec<u8>>> {
        match self.poll()? {
            Visible::Span { start, end } => Ok(Some(self.take(start, end))),
            Visible::Empty { .. } => Ok(None),
        }
    }

    /// Parks until at least one byte is visible, then copies out the whole span.
    pub fn recv(&mut self) -> ChannelResult<Vec<u8>> {
        loop {
            match self.poll()? {
                Visible::Span { start, end } => return Ok(self.take(start, end)),
                Visible::Empty { raw_end } => {
                    wait::wait_u32(&self.memory.header().gen_a_end, raw_end);
                }
            }
        }
    }

    /// Copies up to `buf.len()` visible bytes into `buf` without blocking.
    ///
    /// Only the copied bytes are consumed; the rest stay unread.
    pub fn try_recv_into(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.poll()? {
            Visible::Span { start, end } => Ok(self.take_into(start, end, buf)),
            Visible::Empty { .. } => Ok(0),
        }
    }

    /// Parks until data is visible, then copies up to `buf.len()` bytes.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.poll()? {
                Visible::Span { start, end } => return Ok(self.take_into(start, end, buf)),
                Visible::Empty { raw_end } => {
                    wait::wait_u32(&self.memory.header().gen_a_end, raw_end);
                }
            }
        }
    }

    fn poll(&self) -> ChannelResult<Visible> {
        let header = self.memory.header();
        let capacity = self.memory.capacity();
        loop {
            let start = header.unread_start.load(Ordering::Relaxed);
            let raw_end = header.gen_a_end.load(Ordering::Acquire);
            let end = raw_end & OFFSET_MASK;

            if end > capacity || start > end {
                error!(start, end, capacity, "generation A cursors out of range");
                return Err(ChannelError::protocol(format!(
                    "unread_start {start} and gen_a_end {end} do not fit an arena of {capacity} bytes"
                )));
            }
            if start < end {
                return Ok(Visible::Span { start, end });
            }
            if raw_end & SEALED == 0 {
                return Ok(Visible::Empty { raw_end });
            }
            self.promote()?;
        }
    }

    fn promote(&self) -> ChannelResult<()> {
        let header = self.memory.header();
        let b_end = header.gen_b_end.load(Ordering::Acquire);
        if b_end == IDLE || b_end > self.memory.capacity() {
            error!(b_end, "generation A sealed without a usable generation B");
            return Err(ChannelError::protocol(format!(
                "gen_b_end {b_end} is not a valid offset while generation A is sealed"
            )));
        }

        if header
            .gen_b_end
            .compare_exchange(b_end, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // The producer committed more bytes to B; look again.
            return Ok(());
        }

        header.gen_a_end.store(b_end, Ordering::Release);
        header.unread_start.store(0, Ordering::Release);
        header
            .active_generation
            .store(Generation::A as u32, Ordering::Release);
        wait::wake_one(&header.active_generation);
        wait::wake_one(&header.unread_start);
        debug!(promoted = b_end, "promoted generation B to A");
        Ok(())
    }

    fn take(&mut self, start: u32, end: u32) -> Vec<u8> {
        let mut out = vec![0u8; (end - start) as usize];
        self.consume(start, &mut out);
        out
    }

    fn take_into(&mut self, start: u32, end: u32, buf: &mut [u8]) -> usize {
        let len = buf.len().min((end - start) as usize);
        self.consume(start, &mut buf[..len]);
        len
    }

    fn consume(&mut self, start: u32, out: &mut [u8]) {
        let header = self.memory.header();
        unsafe {
            // SAFETY: `[start, start + out.len())` lies below the `gen_a_end` value
            // loaded with acquire ordering in `poll`.
            self.memory.read_arena(start, out);
        }
        let next = start + out.len() as u32;
        header.unread_start.store(next, Ordering::Release);
        wait::wake_one(&header.unread_start);
        trace!(start, next, "consumed generation A");
    }
}
