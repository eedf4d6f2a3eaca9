//! Shared primitive types threaded through every layer of the stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use blockvault_format::NIL_PTR;

/// A block pointer. `NIL_PTR` (`u64::MAX`) means "no block".
pub type BlockPtr = u64;

/// Tags a block so layers that care (integrity, encryption) can treat
/// metadata and file content differently without the allocator or the
/// skiplist needing to know why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// The caller did not say; treated the same as `Metadata`.
    Unknown,
    /// Directory entries, inode records, the allocator's `State` block.
    Metadata,
    /// File content blocks.
    Content,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Unknown
    }
}

/// A cooperative cancellation flag passed into `Start` so a caller stuck
/// waiting on WAL back-pressure can give up instead of blocking forever.
///
/// Cloning shares the same underlying flag; `cancel` is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!a.is_cancelled());
        b.cancel();
        assert!(a.is_cancelled());
    }
}
