//! Layout descriptors for host glue.
//!
//! These structs capture byte offsets and lengths of the header and arena so
//! that JS/TS glue can build `Int32Array` / `Uint8Array` views over the same
//! memory without copying. Natively the offsets are relative to the start of
//! the allocation; on `wasm32` [`SharedChannel::wasm_layout`] reports absolute
//! linear-memory offsets.
//!
//! [`SharedChannel::wasm_layout`]: crate::SharedChannel

/// Byte-range descriptor within the shared memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Offset in bytes from the start of the shared memory.
    pub offset: u32,
    /// Length in bytes for the region.
    pub length: u32,
}

impl Region {
    /// Exclusive end offset.
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// Layout metadata for a shared channel.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelLayout {
    /// Four 32-bit header slots: unread_start, gen_a_end, gen_b_end, active_generation.
    pub header: Region,
    /// Arena holding payload bytes.
    pub data: Region,
    /// Capacity of the arena in bytes.
    pub capacity_bytes: u32,
}

impl ChannelLayout {
    /// Index of `unread_start` in an `Int32Array` view over the header.
    pub const UNREAD_START: usize = 0;
    /// Index of `gen_a_end`.
    pub const GEN_A_END: usize = 1;
    /// Index of `gen_b_end`.
    pub const GEN_B_END: usize = 2;
    /// Index of `active_generation`.
    pub const ACTIVE_GENERATION: usize = 3;

    /// Total bytes covered by header and arena.
    pub fn total_len(&self) -> u32 {
        self.data.end() - self.header.offset
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn total_len_spans_header_and_data() {
        let layout = ChannelLayout {
            header: Region {
                offset: 1024,
                length: 16,
            },
            data: Region {
                offset: 1040,
                length: 256,
            },
            capacity_bytes: 256,
        };
        assert_eq!(layout.total_len(), 272);
        assert_eq!(layout.data.end(), 1296);
    }
}
