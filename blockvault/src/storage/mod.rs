//! The layered storage stack (§2, §4, §6): each layer implements
//! [`BlockStorage`] by wrapping another `BlockStorage` (or, at the bottom,
//! a [`ReliableStorage`] wrapping an [`ObjectStorage`]), translating the
//! pointer-keyed, transactional contract at its own level.
//!
//! The stack is built as nested generics rather than trait objects —
//! `BlockFilesystem<Crypto<Integrity<AppStorage<Buffered<Wal<O>>>>>>` — so
//! that `rustc` monomorphizes the whole call chain and `State` access can be
//! threaded through with [`HasState`] instead of a dynamic downcast.

pub mod app;
pub mod buffered;
pub mod crypto;
pub mod disk_object;
pub mod integrity;
pub mod memory_object;
pub mod oram;
pub mod wal;

use std::collections::HashMap;

use blockvault_format::RawBlock;

use crate::error::Result;
use crate::state::State;
use crate::types::{BlockPtr, CancelToken, DataType};

/// L0: a flat, namespaced key-value store. The only layer that talks to an
/// actual object store (or a disk directory standing in for one).
pub trait ObjectStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Keys with the given prefix, for crash-recovery scans.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// L1: the contract `LocalWAL` gives everything above it — durable,
/// atomic multi-key commits, even though the L0 object store underneath
/// only promises atomic single-key puts.
pub trait ReliableStorage: Send {
    fn start(&mut self, prefetch: &[String], cancel: &CancelToken) -> Result<HashMap<String, Vec<u8>>>;
    fn get(&mut self, key: &str) -> Result<Vec<u8>>;
    /// `None` as a value means "delete this key" when the batch commits.
    fn commit(&mut self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<()>;
    fn rollback(&mut self);
}

/// L2 through L7's common contract: a pointer-keyed transactional block
/// store. `start`/`commit`/`rollback` bracket a single logical transaction;
/// calling `start` twice without an intervening `commit`/`rollback` is a
/// `TransactionState` error.
pub trait BlockStorage: Send {
    fn start(&mut self, prefetch: &[BlockPtr], cancel: &CancelToken) -> Result<HashMap<BlockPtr, RawBlock>>;
    fn get(&mut self, ptr: BlockPtr) -> Result<RawBlock>;
    fn get_many(&mut self, ptrs: &[BlockPtr]) -> Result<HashMap<BlockPtr, RawBlock>> {
        let mut out = HashMap::with_capacity(ptrs.len());
        for &ptr in ptrs {
            out.insert(ptr, self.get(ptr)?);
        }
        Ok(out)
    }
    fn set(&mut self, ptr: BlockPtr, data_type: DataType, data: RawBlock) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self);
}

/// Implemented only by `AppStorage` and the pass-through layers stacked
/// above it, so `BlockFilesystem` can reach the shared allocator `State`
/// without every `BlockStorage` implementor needing to know about it.
pub trait HasState: BlockStorage {
    fn state(&mut self) -> Result<&mut State>;
}
