//! L6 (optional): Path-ORAM over the encryption layer, hiding which
//! logical block a caller touched behind reads and writes of an entire
//! root-to-leaf bucket path on every access (§4.8).
//!
//! Every access (`get` or `set`) re-randomizes the accessed block's leaf
//! assignment, reads the old path into the stash, and evicts greedily back
//! down that same path, so an observer watching only *which physical
//! buckets* were touched on the layer below learns nothing about which
//! logical pointer the caller actually wanted.
//!
//! A transaction sits in one of three states: Idle (no transaction),
//! Active (accesses proceeding normally), or Dirty (an eviction overflowed
//! the stash past `stash_limit`). Dirty is sticky: every `get`/`set`/
//! `commit` refuses with [`Error::OramDirty`] until the caller calls
//! [`BlockStorage::rollback`], because the stash overflow means the
//! written-back buckets on disk may no longer agree with `state.stash`,
//! and no further access can be trusted to preserve that invariant.
//!
//! Rollback does not simply discard the transaction: a successful access's
//! leaf re-randomization is what hides which pointer was touched, so
//! `rollback` on an otherwise-healthy transaction restores the stashed
//! *values* the caller wrote to what they were before the transaction
//! while still persisting the re-assignments and evictions those accesses
//! performed (§4.8). Only a transaction that went Dirty gives up on this —
//! the stash can no longer be trusted, so `rollback` discards everything
//! and reloads the last-saved position map instead.

use std::collections::HashMap;

use blockvault_format::RawBlock;
use blockvault_pages::tree::{parent_step, root_node};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oram::{ObliviousState, ObliviousStorage, StashEntry};
use crate::storage::{BlockStorage, HasState};
use crate::types::{BlockPtr, CancelToken, DataType};

/// Blocks held per bucket node. Small values keep buckets tiny but
/// increase stash pressure; 4 is the conventional Path-ORAM default.
pub const BUCKET_CAPACITY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Bucket {
    slots: Vec<Option<(BlockPtr, u64, Vec<u8>)>>,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            slots: vec![None; BUCKET_CAPACITY],
        }
    }

    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("bucket serialization cannot fail")
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::corruption(0, format!("malformed ORAM bucket: {e}")))
    }
}

pub struct Oram<S: BlockStorage> {
    inner: S,
    oblivious: Box<dyn ObliviousStorage>,
    capacity_leaves: u64,
    stash_limit: usize,
    state: ObliviousState,
    /// Snapshot of `state` as loaded at `start`, restored verbatim if the
    /// transaction goes dirty and is then rolled back.
    state_at_start: ObliviousState,
    /// The value read (or absence) the first time each pointer was touched
    /// this transaction, so a non-dirty `rollback` can put the stash back
    /// the way it was without undoing the leaf re-assignments.
    original_values: HashMap<BlockPtr, Option<Vec<u8>>>,
    /// The old leaf each `access()` evicted along, in order, so a
    /// non-dirty `rollback` can replay those evictions against the
    /// reverted stash.
    touched_old_leaves: Vec<u64>,
    active: bool,
    dirty: bool,
}

impl<S: BlockStorage> Oram<S> {
    pub fn new(inner: S, oblivious: Box<dyn ObliviousStorage>, capacity_leaves: u64, stash_limit: usize) -> Self {
        Self {
            inner,
            oblivious,
            capacity_leaves: capacity_leaves.max(1),
            stash_limit,
            state: ObliviousState::default(),
            state_at_start: ObliviousState::default(),
            original_values: HashMap::new(),
            touched_old_leaves: Vec::new(),
            active: false,
            dirty: false,
        }
    }

    fn random_leaf(&self) -> u64 {
        rand::rng().random_range(0..self.capacity_leaves)
    }

    fn path_nodes(&self, leaf: u64) -> Vec<u64> {
        Self::path_nodes_for(self.capacity_leaves, leaf)
    }

    fn path_nodes_for(capacity_leaves: u64, leaf: u64) -> Vec<u64> {
        let root = root_node(capacity_leaves);
        let mut node = 2 * leaf;
        let mut path = vec![node];
        while node != root {
            node = parent_step(node);
            path.push(node);
        }
        path
    }

    fn read_path_into_stash(&mut self, leaf: u64) -> Result<()> {
        for &node in &self.path_nodes(leaf) {
            let bucket = match self.inner.get(node) {
                Ok(block) => Bucket::decode(block.as_ref())?,
                Err(e) if e.is_not_found() => Bucket::empty(),
                Err(e) => return Err(e),
            };
            for slot in bucket.slots.into_iter().flatten() {
                let (ptr, assigned_leaf, data) = slot;
                if !self.state.stash.iter().any(|e| e.ptr == ptr) {
                    self.state.stash.push(StashEntry {
                        ptr,
                        leaf: assigned_leaf,
                        data,
                    });
                }
            }
        }
        Ok(())
    }

    /// Greedily re-packs as much of the stash as will fit back along the
    /// path to `leaf`, deepest bucket first, and writes every bucket on
    /// the path (including now-empty ones) back through `inner`.
    fn evict_path(&mut self, leaf: u64) -> Result<()> {
        let nodes = self.path_nodes(leaf);
        let mut buckets: Vec<Bucket> = nodes.iter().map(|_| Bucket::empty()).collect();

        let capacity_leaves = self.capacity_leaves;
        for (depth, &node) in nodes.iter().enumerate().rev() {
            let node_is_on_path =
                |candidate_leaf: u64| Self::path_nodes_for(capacity_leaves, candidate_leaf).contains(&node);
            let slots = &mut buckets[depth].slots;
            let mut slot_idx = 0;
            let mut remaining = Vec::with_capacity(self.state.stash.len());
            for entry in self.state.stash.drain(..) {
                if slot_idx < slots.len() && node_is_on_path(entry.leaf) {
                    slots[slot_idx] = Some((entry.ptr, entry.leaf, entry.data));
                    slot_idx += 1;
                } else {
                    remaining.push(entry);
                }
            }
            self.state.stash = remaining;
        }

        for (node, bucket) in nodes.into_iter().zip(buckets) {
            self.inner.set(node, DataType::Metadata, RawBlock::from(bucket.encode()))?;
        }

        if self.state.stash.len() > self.stash_limit {
            self.dirty = true;
            return Err(Error::OramDirty);
        }
        Ok(())
    }

    fn access(&mut self, ptr: BlockPtr, new_value: Option<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        let fallback_leaf = self.random_leaf();
        let old_leaf = *self
            .state
            .positions
            .entry(ptr)
            .or_insert_with(|| fallback_leaf);
        let new_leaf = self.random_leaf();
        self.state.positions.insert(ptr, new_leaf);

        self.read_path_into_stash(old_leaf)?;

        let existing = self
            .state
            .stash
            .iter()
            .position(|e| e.ptr == ptr)
            .map(|idx| self.state.stash[idx].data.clone());

        self.original_values.entry(ptr).or_insert_with(|| existing.clone());

        match &new_value {
            Some(data) => {
                if let Some(idx) = self.state.stash.iter().position(|e| e.ptr == ptr) {
                    self.state.stash[idx].data = data.clone();
                    self.state.stash[idx].leaf = new_leaf;
                } else {
                    self.state.stash.push(StashEntry {
                        ptr,
                        leaf: new_leaf,
                        data: data.clone(),
                    });
                }
            }
            None => {
                if let Some(idx) = self.state.stash.iter().position(|e| e.ptr == ptr) {
                    self.state.stash[idx].leaf = new_leaf;
                }
            }
        }

        self.touched_old_leaves.push(old_leaf);
        self.evict_path(old_leaf)?;

        match new_value {
            Some(_) => Ok(None),
            None => match existing {
                Some(v) => Ok(Some(v)),
                None => Err(Error::NotFound(format!("oram ptr {ptr}"))),
            },
        }
    }
}

impl<S: BlockStorage> BlockStorage for Oram<S> {
    fn start(&mut self, _prefetch: &[BlockPtr], cancel: &CancelToken) -> Result<HashMap<BlockPtr, RawBlock>> {
        if self.active {
            return Err(Error::TransactionAlreadyActive);
        }
        // Path-ORAM accesses are inherently sequential (each depends on
        // the stash state left by the last), so prefetch is not honored;
        // `get` issues its own path read per pointer.
        self.inner.start(&[], cancel)?;
        self.state = self.oblivious.load()?;
        self.state_at_start = self.state.clone();
        self.original_values.clear();
        self.touched_old_leaves.clear();
        self.active = true;
        self.dirty = false;
        Ok(HashMap::new())
    }

    fn get(&mut self, ptr: BlockPtr) -> Result<RawBlock> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        if self.dirty {
            return Err(Error::OramDirty);
        }
        let data = self.access(ptr, None)?;
        Ok(RawBlock::from(data.unwrap_or_default()))
    }

    fn set(&mut self, ptr: BlockPtr, _data_type: DataType, data: RawBlock) -> Result<()> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        if self.dirty {
            return Err(Error::OramDirty);
        }
        self.access(ptr, Some(data.as_ref().to_vec()))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        if self.dirty {
            return Err(Error::OramDirty);
        }
        self.inner.commit()?;
        self.state.version += 1;
        self.oblivious.save(&self.state)?;
        self.active = false;
        Ok(())
    }

    /// A caller-initiated rollback discards the *data* a transaction wrote
    /// but must not discard the privacy that transaction's accesses
    /// bought: every successful `get`/`set` already re-randomized a leaf
    /// assignment and evicted the stash along the old path, and that
    /// traffic is what an observer of the object store would have seen
    /// regardless of whether the transaction is kept. Reverting it on
    /// rollback would make "rolled back" distinguishable from "committed"
    /// by access pattern alone, defeating the point.
    ///
    /// So a non-dirty rollback puts the stashed *values* back to what they
    /// were the first time this transaction touched each pointer, replays
    /// the evictions those accesses performed against the corrected stash,
    /// and then persists the result exactly like a commit. Only a
    /// transaction that went `Dirty` gives up on this: the stash can no
    /// longer be trusted to reflect what's on the path, so that case falls
    /// back to discarding the base transaction and reloading the
    /// last-saved position map.
    fn rollback(&mut self) {
        if self.dirty {
            self.inner.rollback();
            self.state = self.state_at_start.clone();
            self.dirty = false;
            self.active = false;
            self.original_values.clear();
            self.touched_old_leaves.clear();
            return;
        }

        for (&ptr, original) in &self.original_values {
            match original {
                Some(data) => {
                    if let Some(idx) = self.state.stash.iter().position(|e| e.ptr == ptr) {
                        self.state.stash[idx].data = data.clone();
                    } else {
                        let leaf = *self.state.positions.get(&ptr).unwrap_or(&0);
                        self.state.stash.push(StashEntry {
                            ptr,
                            leaf,
                            data: data.clone(),
                        });
                    }
                }
                None => self.state.stash.retain(|e| e.ptr != ptr),
            }
        }

        let touched_old_leaves = std::mem::take(&mut self.touched_old_leaves);
        for leaf in touched_old_leaves {
            if self.evict_path(leaf).is_err() {
                // The reversion itself overflowed the stash; there is no
                // safe corrected state left to persist, so fall back to
                // surrendering privacy for this transaction.
                break;
            }
        }

        if self.dirty {
            self.inner.rollback();
            self.state = self.state_at_start.clone();
            self.dirty = false;
        } else {
            let _ = self.inner.commit();
            self.state.version += 1;
            let _ = self.oblivious.save(&self.state);
        }

        self.active = false;
        self.original_values.clear();
    }
}

impl<S: HasState> HasState for Oram<S> {
    fn state(&mut self) -> Result<&mut crate::state::State> {
        self.inner.state()
    }
}
