//! Memory backing for the channel header and arena.
//!
//! Native builds map anonymous memory; WebAssembly builds either allocate on
//! the heap (which lives in the shared linear memory) or borrow a region the
//! JS glue already placed there. The unsafe surface stays inside this module:
//! callers receive a base pointer and a length, nothing else.

use crate::{ChannelError, ChannelResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Mapped(memmap2::MmapMut),
    Owned(Layout),
    #[cfg(target_arch = "wasm32")]
    Borrowed,
}

/// Contiguous, aligned memory shared by the producer and consumer threads.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region is plain bytes; concurrent access is coordinated by the
// channel header, which only hands out disjoint byte ranges to each side.
unsafe impl Send for SharedRegion {}
// SAFETY: as above, `&SharedRegion` only exposes a raw base pointer.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new zeroed region of `len` bytes aligned to `alignment`.
    ///
    /// On native builds the request is first served by an anonymous `mmap`.
    /// If the mapping is not suitably aligned we fall back to the heap.
    pub fn new_aligned(len: usize, alignment: usize) -> ChannelResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(ChannelError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(region) = Self::mmap_backed(len, alignment)? {
                return Ok(region);
            }
        }

        Self::heap_backed(len, alignment)
    }

    /// Attaches to `len` bytes of linear memory starting at `offset`.
    ///
    /// # Safety
    /// The range must stay allocated and must not be handed to anything other
    /// than one channel for the lifetime of the returned region.
    #[cfg(target_arch = "wasm32")]
    pub unsafe fn from_linear_memory(
        offset: u32,
        len: usize,
        alignment: usize,
    ) -> ChannelResult<Self> {
        let ptr = NonNull::new(offset as usize as *mut u8)
            .filter(|ptr| ptr.as_ptr() as usize % alignment == 0)
            .ok_or(ChannelError::AllocationFailed {
                size: len,
                alignment,
            })?;
        Ok(Self {
            ptr,
            len,
            alignment,
            backing: Backing::Borrowed,
        })
    }

    fn heap_backed(len: usize, alignment: usize) -> ChannelResult<Self> {
        let failed = ChannelError::AllocationFailed {
            size: len,
            alignment,
        };
        let layout = Layout::from_size_align(len, alignment).map_err(|_| failed.clone())?;

        let raw = unsafe {
            // SAFETY: `layout` has a non-zero size, checked in `new_aligned`.
            alloc_zeroed(layout)
        };

        let ptr = NonNull::new(raw).ok_or(failed)?;
        Ok(Self {
            ptr,
            len,
            alignment,
            backing: Backing::Owned(layout),
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed(len: usize, alignment: usize) -> ChannelResult<Option<Self>> {
        // Anonymous mappings are zero-filled by the kernel.
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| ChannelError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let raw = map.as_mut_ptr();
        if raw as usize % alignment != 0 {
            return Ok(None);
        }

        let Some(ptr) = NonNull::new(raw) else {
            return Ok(None);
        };
        Ok(Some(Self {
            ptr,
            len,
            alignment,
            backing: Backing::Mapped(map),
        }))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Base pointer of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned(layout) = &self.backing {
            unsafe {
                // SAFETY: `ptr` was returned by `alloc_zeroed` with this layout.
                dealloc(self.ptr.as_ptr(), *layout);
            }
        }
    }
}
