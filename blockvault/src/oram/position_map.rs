//! The two tables a Path-ORAM access needs across transactions: which leaf
//! each logical block is currently assigned to, and the stash of blocks
//! that did not fit back into the bucket tree on their last eviction
//! (§4.8). Keyed by `(ptr, version)` so a crash between `commit` and the
//! object store catching up cannot confuse an old, uncommitted version's
//! leaves with the current ones.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::BlockPtr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StashEntry {
    pub ptr: BlockPtr,
    pub leaf: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObliviousState {
    pub version: u64,
    pub positions: HashMap<BlockPtr, u64>,
    pub stash: Vec<StashEntry>,
}

/// Persists [`ObliviousState`] across transactions, local to the node
/// running the archive (never sent to the object store, since revealing
/// it would defeat the point of hiding access patterns).
pub trait ObliviousStorage: Send {
    fn load(&mut self) -> crate::error::Result<ObliviousState>;
    fn save(&mut self, state: &ObliviousState) -> crate::error::Result<()>;
}

/// A purely in-memory implementation; loses the position map and stash on
/// process restart, which is acceptable for tests and ephemeral archives.
#[derive(Default)]
pub struct MemoryOblivious {
    state: ObliviousState,
}

impl ObliviousStorage for MemoryOblivious {
    fn load(&mut self) -> crate::error::Result<ObliviousState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &ObliviousState) -> crate::error::Result<()> {
        self.state = state.clone();
        Ok(())
    }
}

/// Persists to a JSON file on local disk, so the position map survives a
/// process restart.
pub struct FileOblivious {
    path: std::path::PathBuf,
}

impl FileOblivious {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ObliviousStorage for FileOblivious {
    fn load(&mut self) -> crate::error::Result<ObliviousState> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| crate::error::Error::Other(format!("corrupt position map: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObliviousState::default()),
            Err(e) => Err(crate::error::Error::Io(e)),
        }
    }

    fn save(&mut self, state: &ObliviousState) -> crate::error::Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| crate::error::Error::Other(format!("cannot serialize position map: {e}")))?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_oblivious_round_trips() {
        let mut store = MemoryOblivious::default();
        let mut state = ObliviousState::default();
        state.positions.insert(3, 7);
        state.stash.push(StashEntry {
            ptr: 3,
            leaf: 7,
            data: vec![1, 2, 3],
        });
        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.positions.get(&3), Some(&7));
        assert_eq!(loaded.stash.len(), 1);
    }

    #[test]
    fn file_oblivious_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position-map.json");

        let mut state = ObliviousState::default();
        state.positions.insert(1, 2);
        FileOblivious::new(&path).save(&state).unwrap();

        let loaded = FileOblivious::new(&path).load().unwrap();
        assert_eq!(loaded.positions.get(&1), Some(&2));
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let loaded = FileOblivious::new(&path).load().unwrap();
        assert!(loaded.positions.is_empty());
    }
}
