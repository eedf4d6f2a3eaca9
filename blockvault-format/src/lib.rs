//! Bit-exact on-disk block format shared by every persistence layer.
//!
//! A block is a fixed-size byte string split into a pointers section (a
//! skiplist's forward-pointer table) and a data section (a 3-byte
//! little-endian length prefix followed by `data_size` bytes of payload).
//! Nothing in this crate knows about skiplists, allocators, or transactions —
//! it only knows how to turn a [`Block`] into bytes and back, bit for bit.

#![allow(clippy::len_without_is_empty)]

mod error;
mod raw;

pub use error::FormatError;
pub use raw::RawBlock;

/// Sentinel pointer value meaning "no block".
pub const NIL_PTR: u64 = u64::MAX;

/// The fixed geometry of every block in one archive: how many forward
/// pointers it carries, and how many bytes of payload follow the length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLayout {
    pub num_ptrs: usize,
    pub data_size: usize,
}

impl BlockLayout {
    /// The recommended defaults from the specification: 12 skiplist slots,
    /// 32 KiB of payload per block.
    pub const DEFAULT: BlockLayout = BlockLayout {
        num_ptrs: 12,
        data_size: 32 * 1024,
    };

    /// Total on-the-wire size of a block under this layout.
    pub const fn block_size(&self) -> usize {
        8 * self.num_ptrs + 3 + self.data_size
    }

    fn validate(&self) -> Result<(), FormatError> {
        if self.data_size >= (1 << 24) {
            return Err(FormatError::DataSizeTooLarge(self.data_size));
        }
        if self.num_ptrs == 0 {
            return Err(FormatError::ZeroPointers);
        }
        Ok(())
    }
}

/// A single decoded block: a skiplist pointer table plus a variable-length
/// (but bounded) data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    layout: BlockLayout,
    ptrs: Vec<u64>,
    data: Vec<u8>,
}

impl Block {
    /// Build a new, empty block (all pointers `NIL_PTR`, empty payload).
    pub fn empty(layout: BlockLayout) -> Result<Self, FormatError> {
        layout.validate()?;
        Ok(Self {
            ptrs: vec![NIL_PTR; layout.num_ptrs],
            data: Vec::new(),
            layout,
        })
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn ptr(&self, slot: usize) -> u64 {
        self.ptrs[slot]
    }

    pub fn set_ptr(&mut self, slot: usize, ptr: u64) {
        self.ptrs[slot] = ptr;
    }

    pub fn ptrs(&self) -> &[u64] {
        &self.ptrs
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the data payload. Fails if it would not fit in `data_size`
    /// bytes.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), FormatError> {
        if data.len() > self.layout.data_size {
            return Err(FormatError::DataTooLarge {
                len: data.len(),
                max: self.layout.data_size,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Serialize to the bit-exact on-disk representation: the pointer table,
    /// a 3-byte little-endian length, then `data_size` bytes of payload
    /// (zero-padded past the logical length).
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.block_size());
        for ptr in &self.ptrs {
            out.extend_from_slice(&ptr.to_le_bytes());
        }
        let len = self.data.len() as u32;
        out.push((len & 0xFF) as u8);
        out.push(((len >> 8) & 0xFF) as u8);
        out.push(((len >> 16) & 0xFF) as u8);
        out.extend_from_slice(&self.data);
        out.resize(self.layout.block_size(), 0);
        out
    }

    /// Parse a block from its bit-exact on-disk representation.
    pub fn unmarshal(layout: BlockLayout, bytes: &[u8]) -> Result<Self, FormatError> {
        layout.validate()?;
        if bytes.len() != layout.block_size() {
            return Err(FormatError::SizeMismatch {
                expected: layout.block_size(),
                actual: bytes.len(),
            });
        }
        let mut ptrs = Vec::with_capacity(layout.num_ptrs);
        for i in 0..layout.num_ptrs {
            let off = i * 8;
            let raw: [u8; 8] = bytes[off..off + 8].try_into().unwrap();
            ptrs.push(u64::from_le_bytes(raw));
        }
        let len_off = layout.num_ptrs * 8;
        let len = bytes[len_off] as u32
            | (bytes[len_off + 1] as u32) << 8
            | (bytes[len_off + 2] as u32) << 16;
        let len = len as usize;
        if len > layout.data_size {
            return Err(FormatError::DataTooLarge {
                len,
                max: layout.data_size,
            });
        }
        let data_off = len_off + 3;
        let data = bytes[data_off..data_off + len].to_vec();
        Ok(Self { layout, ptrs, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_block_round_trips() {
        let layout = BlockLayout::DEFAULT;
        let block = Block::empty(layout).unwrap();
        let bytes = block.marshal();
        assert_eq!(bytes.len(), layout.block_size());
        let back = Block::unmarshal(layout, &bytes).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn rejects_oversized_payload() {
        let layout = BlockLayout {
            num_ptrs: 2,
            data_size: 4,
        };
        let mut block = Block::empty(layout).unwrap();
        assert!(matches!(
            block.set_data(&[0u8; 5]),
            Err(FormatError::DataTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn round_trip(
            num_ptrs in 1usize..16,
            data_size in 0usize..512,
            ptr_seed in proptest::collection::vec(any::<u64>(), 0..16),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let layout = BlockLayout { num_ptrs, data_size };
            let payload_len = payload.len().min(data_size);
            let mut block = Block::empty(layout).unwrap();
            for (slot, seed) in ptr_seed.iter().enumerate().take(num_ptrs) {
                block.set_ptr(slot, *seed);
            }
            block.set_data(&payload[..payload_len]).unwrap();
            let bytes = block.marshal();
            prop_assert_eq!(bytes.len(), layout.block_size());
            let back = Block::unmarshal(layout, &bytes).unwrap();
            prop_assert_eq!(block, back);
        }
    }
}
