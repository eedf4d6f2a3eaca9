//! L3: `AppStorage` shifts the pointer key space by one and reserves
//! pointer 0 of the space below it for the shared allocator `State`
//! (§4.4). Everything above this layer addresses blocks starting at 0;
//! `AppStorage` is the only layer that knows `State` lives at the
//! underlying pointer 0.

use std::collections::HashMap;

use blockvault_format::RawBlock;

use crate::error::{Error, Result};
use crate::state::{State, STATE_ENCODED_LEN};
use crate::storage::{BlockStorage, HasState};
use crate::types::{BlockPtr, CancelToken, DataType};

const STATE_PTR: BlockPtr = 0;

pub struct AppStorage<S: BlockStorage> {
    inner: S,
    state: Option<State>,
    state_dirty: bool,
}

impl<S: BlockStorage> AppStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: None,
            state_dirty: false,
        }
    }

    fn shift(ptr: BlockPtr) -> Result<BlockPtr> {
        ptr.checked_add(1)
            .ok_or_else(|| Error::Other("pointer space exhausted".into()))
    }
}

impl<S: BlockStorage> BlockStorage for AppStorage<S> {
    fn start(&mut self, prefetch: &[BlockPtr], cancel: &CancelToken) -> Result<HashMap<BlockPtr, RawBlock>> {
        let mut shifted = Vec::with_capacity(prefetch.len() + 1);
        shifted.push(STATE_PTR);
        for &p in prefetch {
            shifted.push(Self::shift(p)?);
        }
        let raw = self.inner.start(&shifted, cancel)?;

        self.state = Some(match raw.get(&STATE_PTR) {
            Some(block) => State::decode(block.as_ref())?,
            None => match self.inner.get(STATE_PTR) {
                Ok(block) => State::decode(block.as_ref())?,
                Err(e) if e.is_not_found() => State::default(),
                Err(e) => return Err(e),
            },
        });
        self.state_dirty = false;

        let mut out = HashMap::with_capacity(prefetch.len());
        for &p in prefetch {
            if let Some(block) = raw.get(&Self::shift(p)?) {
                out.insert(p, block.clone());
            }
        }
        Ok(out)
    }

    fn get(&mut self, ptr: BlockPtr) -> Result<RawBlock> {
        self.inner.get(Self::shift(ptr)?)
    }

    fn set(&mut self, ptr: BlockPtr, data_type: DataType, data: RawBlock) -> Result<()> {
        self.inner.set(Self::shift(ptr)?, data_type, data)
    }

    fn commit(&mut self) -> Result<()> {
        if self.state_dirty {
            if let Some(state) = &self.state {
                let bytes = state.encode();
                self.inner
                    .set(STATE_PTR, DataType::Metadata, RawBlock::from(bytes.to_vec()))?;
            }
        }
        self.inner.commit()?;
        self.state = None;
        self.state_dirty = false;
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.rollback();
        self.state = None;
        self.state_dirty = false;
    }
}

impl<S: BlockStorage> HasState for AppStorage<S> {
    fn state(&mut self) -> Result<&mut State> {
        self.state_dirty = true;
        self.state
            .as_mut()
            .ok_or(Error::TransactionNotActive)
    }
}

const _: () = assert!(STATE_ENCODED_LEN > 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffered::Buffered;
    use crate::storage::memory_object::MemoryObjectStore;
    use crate::storage::wal::LocalWal;
    use blockvault_format::NIL_PTR;
    use std::sync::Arc;

    fn fresh_app(dir: &tempfile::TempDir, name: &str) -> AppStorage<Buffered<LocalWal>> {
        let store = Arc::new(MemoryObjectStore::new());
        let wal = LocalWal::open(dir.path().join(name).to_str().unwrap(), 64, store).unwrap();
        AppStorage::new(Buffered::new(wal))
    }

    #[test]
    fn fresh_archive_has_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = fresh_app(&dir, "a.sqlite3");
        let cancel = CancelToken::new();
        app.start(&[], &cancel).unwrap();
        assert_eq!(app.state().unwrap().root_ptr, NIL_PTR);
        app.rollback();
    }

    #[test]
    fn state_persists_across_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = fresh_app(&dir, "b.sqlite3");
        let cancel = CancelToken::new();

        app.start(&[], &cancel).unwrap();
        app.state().unwrap().root_ptr = 42;
        app.commit().unwrap();

        app.start(&[], &cancel).unwrap();
        assert_eq!(app.state().unwrap().root_ptr, 42);
        app.rollback();
    }

    #[test]
    fn regular_blocks_are_shifted_away_from_state_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = fresh_app(&dir, "c.sqlite3");
        let cancel = CancelToken::new();
        app.start(&[], &cancel).unwrap();
        app.set(0, DataType::Content, RawBlock::from(b"zero".to_vec()))
            .unwrap();
        assert_eq!(app.get(0).unwrap().as_ref(), b"zero");
        // Mutating state in the same transaction must not be clobbered by
        // the shifted write to logical pointer 0.
        app.state().unwrap().root_ptr = 7;
        app.commit().unwrap();

        app.start(&[], &cancel).unwrap();
        assert_eq!(app.get(0).unwrap().as_ref(), b"zero");
        assert_eq!(app.state().unwrap().root_ptr, 7);
        app.rollback();
    }
}
