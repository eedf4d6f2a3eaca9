//! The archive's shared allocator state and the allocate/unlink primitives
//! built on top of it (§3, §4.2).
//!
//! `State` is three pointers: the root of the directory tree, the head of
//! the trash (free) list, and the next never-used pointer. It is persisted
//! as a fixed 24-byte little-endian record at key 0 of the `AppStorage`
//! key space — the one block every other block pointer is defined relative
//! to.

use blockvault_format::NIL_PTR;

use crate::error::{Error, Result};
use crate::types::BlockPtr;

pub const STATE_ENCODED_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub root_ptr: BlockPtr,
    pub trash_ptr: BlockPtr,
    pub next_ptr: BlockPtr,
}

impl Default for State {
    fn default() -> Self {
        Self {
            root_ptr: NIL_PTR,
            trash_ptr: NIL_PTR,
            next_ptr: 0,
        }
    }
}

impl State {
    pub fn encode(&self) -> [u8; STATE_ENCODED_LEN] {
        let mut buf = [0u8; STATE_ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.root_ptr.to_le_bytes());
        buf[8..16].copy_from_slice(&self.trash_ptr.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_ptr.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STATE_ENCODED_LEN {
            return Err(Error::corruption(
                0,
                format!(
                    "State record is {} bytes, expected {}",
                    bytes.len(),
                    STATE_ENCODED_LEN
                ),
            ));
        }
        let mut take = |range: std::ops::Range<usize>| -> u64 {
            let mut a = [0u8; 8];
            a.copy_from_slice(&bytes[range]);
            u64::from_le_bytes(a)
        };
        Ok(Self {
            root_ptr: take(0..8),
            trash_ptr: take(8..16),
            next_ptr: take(16..24),
        })
    }

    /// Allocate a pointer, preferring the head of the trash list (reusing a
    /// previously-unlinked block) over minting a brand new one. When reusing
    /// a trash entry, `trash_next` is the value read out of slot 0 of the
    /// block at the current `trash_ptr` — the caller must fetch it before
    /// calling, since `State` itself has no storage access.
    pub fn allocate(&mut self, trash_next: impl FnOnce(BlockPtr) -> Result<BlockPtr>) -> Result<BlockPtr> {
        if self.trash_ptr != NIL_PTR {
            let reused = self.trash_ptr;
            self.trash_ptr = trash_next(reused)?;
            Ok(reused)
        } else {
            let fresh = self.next_ptr;
            self.next_ptr = self
                .next_ptr
                .checked_add(1)
                .ok_or_else(|| Error::Other("pointer space exhausted".into()))?;
            Ok(fresh)
        }
    }

    /// Push `ptr` onto the head of the trash list. The caller is
    /// responsible for having already overwritten slot 0 of the block at
    /// `ptr` with the *previous* `trash_ptr` (this call only updates the
    /// in-memory head).
    pub fn unlink(&mut self, ptr: BlockPtr) {
        self.trash_ptr = ptr;
    }
}
