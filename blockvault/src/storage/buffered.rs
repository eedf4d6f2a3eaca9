//! L2: `Buffered`, which turns the key-value `ReliableStorage` contract
//! into the pointer-keyed `BlockStorage` contract everything above it
//! speaks (§4.3). Writes made during a transaction are held in memory and
//! only handed to the WAL as a single batch on `commit`, so a transaction
//! that writes the same pointer twice only pays for one WAL row.

use std::collections::HashMap;

use blockvault_format::RawBlock;

use crate::error::{Error, Result};
use crate::storage::{BlockStorage, ReliableStorage};
use crate::types::{BlockPtr, CancelToken, DataType};

pub fn block_key(ptr: BlockPtr) -> String {
    format!("blocks/{:020}", ptr)
}

fn ptr_from_key(key: &str) -> Option<BlockPtr> {
    key.strip_prefix("blocks/")?.parse().ok()
}

enum Pending {
    Set(RawBlock),
    Delete,
}

pub struct Buffered<R: ReliableStorage> {
    inner: R,
    active: bool,
    pending: HashMap<BlockPtr, Pending>,
    prefetched: HashMap<BlockPtr, RawBlock>,
}

impl<R: ReliableStorage> Buffered<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            active: false,
            pending: HashMap::new(),
            prefetched: HashMap::new(),
        }
    }
}

impl<R: ReliableStorage> BlockStorage for Buffered<R> {
    fn start(&mut self, prefetch: &[BlockPtr], cancel: &CancelToken) -> Result<HashMap<BlockPtr, RawBlock>> {
        if self.active {
            return Err(Error::TransactionAlreadyActive);
        }
        let keys: Vec<String> = prefetch.iter().map(|&p| block_key(p)).collect();
        let raw = self.inner.start(&keys, cancel)?;
        self.prefetched = raw
            .into_iter()
            .filter_map(|(k, v)| ptr_from_key(&k).map(|p| (p, RawBlock::from(v))))
            .collect();
        self.active = true;
        self.pending.clear();
        Ok(self.prefetched.clone())
    }

    fn get(&mut self, ptr: BlockPtr) -> Result<RawBlock> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        match self.pending.get(&ptr) {
            Some(Pending::Set(block)) => return Ok(block.clone()),
            Some(Pending::Delete) => return Err(Error::NotFound(block_key(ptr))),
            None => {}
        }
        if let Some(block) = self.prefetched.get(&ptr) {
            return Ok(block.clone());
        }
        let bytes = self.inner.get(&block_key(ptr))?;
        let block = RawBlock::from(bytes);
        self.prefetched.insert(ptr, block.clone());
        Ok(block)
    }

    fn set(&mut self, ptr: BlockPtr, _data_type: DataType, data: RawBlock) -> Result<()> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        self.pending.insert(ptr, Pending::Set(data));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.active {
            return Err(Error::TransactionNotActive);
        }
        let writes: Vec<(String, Option<Vec<u8>>)> = self
            .pending
            .drain()
            .map(|(ptr, pending)| {
                let key = block_key(ptr);
                match pending {
                    Pending::Set(block) => (key, Some(block.as_ref().to_vec())),
                    Pending::Delete => (key, None),
                }
            })
            .collect();
        self.inner.commit(writes)?;
        self.prefetched.clear();
        self.active = false;
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.rollback();
        self.pending.clear();
        self.prefetched.clear();
        self.active = false;
    }
}
