//! Park/wake shims keyed on a single header word.
//!
//! Web workers park on wasm linear-memory atomics via `memory_atomic_wait32`
//! while native targets rely on the `atomic-wait` crate (futex-backed where
//! available). Loom builds stub the operations out: waits return immediately,
//! so callers must tolerate spurious returns, which they do anyway.

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicU32;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicU32;

#[cfg(feature = "loom")]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        let _ = (atomic, expected);
        loom::thread::yield_now();
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(all(not(feature = "loom"), target_arch = "wasm32"))]
mod imp {
    use super::AtomicU32;
    use core::arch::wasm32::{memory_atomic_notify, memory_atomic_wait32};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        // SAFETY: The atomic resides in the shared linear memory backing the channel.
        // Ok, not-equal and timed-out all send the caller back to its re-check loop.
        let _ = unsafe {
            memory_atomic_wait32(atomic as *const _ as *mut i32, expected as i32, -1_i64)
        };
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        // SAFETY: Pointer addresses the same shared linear memory used for waits.
        unsafe { memory_atomic_notify(atomic as *const _ as *mut i32, 1) };
    }
}

#[cfg(all(not(feature = "loom"), not(target_arch = "wasm32")))]
mod imp {
    use super::AtomicU32;

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) {
        atomic_wait::wait(atomic, expected);
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        atomic_wait::wake_one(atomic as *const AtomicU32);
    }
}

/// Blocks the caller while `atomic` still holds `expected`.
///
/// Returns after a wake on the same word, a value change, or a spurious
/// wakeup; callers re-check their condition in a loop.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) {
    imp::wait_u32(atomic, expected)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32) {
    imp::wake_one(atomic)
}

#[cfg(all(test, not(feature = "loom"), not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(3);
        wait_u32(&word, 4);
        assert_eq!(word.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn wake_releases_parked_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait_u32(&word, 0);
                }
                word.load(Ordering::Acquire)
            })
        };

        thread::sleep(Duration::from_millis(20));
        word.store(9, Ordering::Release);
        wake_one(&word);
        assert_eq!(waiter.join().expect("waiter thread"), 9);
    }
}
