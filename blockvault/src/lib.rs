//! A layered, encrypted, integrity-protected block-persistence library for
//! building POSIX-like filesystems over an abstract object store.
//!
//! The stack, bottom to top: an [`storage::ObjectStorage`] (a disk directory
//! or any flat key-value backend) is wrapped by a local write-ahead log that
//! turns its single-key puts into durable multi-key transactions, then by an
//! in-memory buffering layer, then by the pointer-space-shifting
//! [`storage::app::AppStorage`] layer that carries the shared allocator
//! [`state::State`]. Integrity, encryption, and (optionally) Path-ORAM wrap
//! that in turn, and [`blockfile::BlockFile`] is the variable-length,
//! skiplist-addressed file built on top of whichever combination of those
//! layers an archive is configured with.
//!
//! Every layer implements [`storage::BlockStorage`] by wrapping another one,
//! so the whole stack monomorphizes at compile time instead of going through
//! a trait object — see [`Archive`] for the concrete type aliases this
//! crate assembles by default.

pub mod blockfile;
pub mod config;
pub mod crypto;
pub mod error;
#[cfg(feature = "oram")]
pub mod oram;
#[cfg(feature = "remote")]
pub mod remote;
pub mod retry;
pub mod state;
pub mod storage;
pub mod types;

pub use blockfile::{Addressing, BlockFile};
pub use config::ArchiveConfig;
pub use crypto::MasterKey;
pub use error::{Error, ErrorKind, Result};
pub use state::State;
pub use types::{BlockPtr, CancelToken, DataType};

use std::sync::Arc;

use storage::app::AppStorage;
use storage::buffered::Buffered;
use storage::crypto::Crypto;
use storage::integrity::Integrity;
use storage::wal::LocalWal;
use storage::ObjectStorage;

/// The stack an [`Archive`] built by [`Archive::open`] uses: local WAL,
/// buffering, pointer shift, integrity, encryption. Path-ORAM, when
/// enabled, wraps this again (see [`Archive::storage_mut`]'s caller for how
/// `BlockFile` is parameterized either way).
pub type DefaultStack = Integrity<Crypto<AppStorage<Buffered<LocalWal>>>>;

/// The stack with Path-ORAM wrapping the default one, for archives that
/// opt into access-pattern hiding. Assembled by hand (there is no
/// convenience constructor analogous to [`Archive::open`]) since it also
/// needs an [`oram::ObliviousStorage`] backend chosen by the caller.
#[cfg(feature = "oram")]
pub type OramStack = storage::oram::Oram<DefaultStack>;

/// Assembles the default storage stack from a password and a config, the
/// way a caller who does not want to hand-wire `AppStorage<Buffered<...>>`
/// generics themselves would.
///
/// Archives needing Path-ORAM or a non-default `ObjectStorage` should
/// compose the layers in `storage` directly instead of going through this
/// helper — it exists for the common case, not as the only entry point.
pub struct Archive {
    stack: DefaultStack,
    config: ArchiveConfig,
}

impl Archive {
    pub fn open<O: ObjectStorage + 'static>(
        store: Arc<O>,
        password: &[u8],
        config: ArchiveConfig,
    ) -> Result<Self> {
        config.validate()?;
        let wal = LocalWal::open(&config.wal.db_path, config.wal.high_water_mark, store)?;
        let buffered = Buffered::new(wal);
        let app = AppStorage::new(buffered);
        let master_key = MasterKey::derive(password, &config.crypto)?;
        let crypto = Crypto::new(app, master_key.clone());
        let pin_path = config.integrity.pin_file.as_ref().map(std::path::PathBuf::from);
        let integrity = Integrity::new(crypto, &master_key, pin_path);
        Ok(Self {
            stack: integrity,
            config,
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn storage_mut(&mut self) -> &mut DefaultStack {
        &mut self.stack
    }

    /// Opens the root `BlockFile`, creating one (and recording its head
    /// pointer in `State::root_ptr`) if the archive has none yet.
    pub fn root_file(&mut self, cancel: &CancelToken) -> Result<BlockFile<'_, DefaultStack>> {
        use storage::{BlockStorage, HasState};

        self.stack.start(&[], cancel)?;
        let layout = blockvault_format::BlockLayout {
            num_ptrs: self.config.block_file.num_ptrs,
            data_size: self.config.block_file.data_size,
        };
        let root_ptr = self.stack.state()?.root_ptr;
        if root_ptr == types::NIL_PTR {
            let mut file = BlockFile::create(&mut self.stack, layout, DataType::Content, Addressing::Combined)?;
            file.mark_as_root()?;
            Ok(file)
        } else {
            BlockFile::open(&mut self.stack, layout, DataType::Content, Addressing::Combined, root_ptr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::memory_object::MemoryObjectStore;

    /// Path-ORAM composes *underneath* `BlockFile`, not through `Archive`
    /// (its doc comment says as much): build `OramStack` by hand over the
    /// same default stack `Archive::open` assembles, and drive a
    /// `BlockFile` through it directly.
    #[cfg(feature = "oram")]
    #[test]
    fn block_file_round_trips_through_an_oram_wrapped_default_stack() {
        use crate::oram::MemoryOblivious;
        use storage::crypto::Crypto;
        use storage::{BlockStorage, HasState};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let wal = storage::wal::LocalWal::open(
            dir.path().join("oram.sqlite3").to_str().unwrap(),
            64,
            store,
        )
        .unwrap();
        let buffered = storage::buffered::Buffered::new(wal);
        let app = storage::app::AppStorage::new(buffered);
        let master_key = MasterKey::derive(b"hunter2", &crate::config::CryptoConfig::default()).unwrap();
        let crypto = Crypto::new(app, master_key.clone());
        let integrity = storage::integrity::Integrity::new(crypto, &master_key, None);
        let mut stack: OramStack = storage::oram::Oram::new(integrity, Box::new(MemoryOblivious::default()), 32, 128);

        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = blockvault_format::BlockLayout { num_ptrs: 4, data_size: 16 };
        let head_ptr = {
            let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Combined).unwrap();
            file.write(b"hidden behind oblivious access").unwrap();
            file.head_ptr()
        };
        stack.commit().unwrap();

        stack.start(&[], &cancel).unwrap();
        let mut file = BlockFile::open(&mut stack, layout, DataType::Content, Addressing::Combined, head_ptr).unwrap();
        let mut buf = [0u8; 30];
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(&buf[..total], b"hidden behind oblivious access");
        stack.commit().unwrap();
    }

    #[test]
    fn opens_and_writes_through_the_full_default_stack() {
        use storage::{BlockStorage, HasState};

        let dir = tempfile::tempdir().unwrap();
        let mut config = ArchiveConfig::default();
        config.wal.db_path = dir.path().join("archive.sqlite3").to_str().unwrap().to_string();
        config.block_file.num_ptrs = 4;
        config.block_file.data_size = 16;

        let store = Arc::new(MemoryObjectStore::new());
        let mut archive = Archive::open(store, b"correct horse battery staple", config).unwrap();

        let cancel = CancelToken::new();
        {
            let mut root = archive.root_file(&cancel).unwrap();
            root.write(b"hello, archive").unwrap();
        }
        archive.storage_mut().commit().unwrap();

        {
            archive.storage_mut().start(&[], &cancel).unwrap();
            let root_ptr = archive.storage_mut().state().unwrap().root_ptr;
            let layout = blockvault_format::BlockLayout { num_ptrs: 4, data_size: 16 };
            let mut root = BlockFile::open(
                archive.storage_mut(),
                layout,
                DataType::Content,
                Addressing::Combined,
                root_ptr,
            )
            .unwrap();
            let mut buf = [0u8; 14];
            root.read(&mut buf).unwrap();
            assert_eq!(&buf, b"hello, archive");
        }
        archive.storage_mut().rollback();
    }

    /// Exercises the skiplist, encryption, integrity, and WAL layers
    /// together: a multi-block write, a truncate that reclaims blocks into
    /// the trash list, and a subsequent write that proves those blocks get
    /// reused rather than minting fresh pointers forever.
    #[test]
    fn truncate_and_regrow_reuses_trash_across_the_full_default_stack() {
        use storage::{BlockStorage, HasState};

        let dir = tempfile::tempdir().unwrap();
        let mut config = ArchiveConfig::default();
        config.wal.db_path = dir.path().join("archive.sqlite3").to_str().unwrap().to_string();
        config.block_file.num_ptrs = 4;
        config.block_file.data_size = 8;

        let store = Arc::new(MemoryObjectStore::new());
        let mut archive = Archive::open(store, b"correct horse battery staple", config).unwrap();
        let cancel = CancelToken::new();

        let layout = blockvault_format::BlockLayout { num_ptrs: 4, data_size: 8 };
        let payload: Vec<u8> = (0u8..32).collect();
        {
            let mut root = archive.root_file(&cancel).unwrap();
            root.write(&payload).unwrap();
        }
        archive.storage_mut().commit().unwrap();

        archive.storage_mut().start(&[], &cancel).unwrap();
        let next_ptr_before_truncate = archive.storage_mut().state().unwrap().next_ptr;
        let root_ptr = archive.storage_mut().state().unwrap().root_ptr;
        {
            // Truncate and the follow-up append share one handle: `truncate`
            // leaves the handle positioned exactly at the new end of block
            // 0, which is the only position a fresh append can resume from
            // without reopening into a skiplist slot that doesn't exist yet.
            let mut root = BlockFile::open(
                archive.storage_mut(),
                layout,
                DataType::Content,
                Addressing::Combined,
                root_ptr,
            )
            .unwrap();
            root.truncate(8).unwrap();
            root.write(&payload[8..16]).unwrap();
        }
        let next_ptr_after_regrow = archive.storage_mut().state().unwrap().next_ptr;
        archive.storage_mut().commit().unwrap();

        // Regrowth reused the trashed block instead of minting a new pointer.
        assert_eq!(next_ptr_after_regrow, next_ptr_before_truncate);

        archive.storage_mut().start(&[], &cancel).unwrap();
        let root_ptr = archive.storage_mut().state().unwrap().root_ptr;
        let mut root = BlockFile::open(
            archive.storage_mut(),
            layout,
            DataType::Content,
            Addressing::Combined,
            root_ptr,
        )
        .unwrap();
        let mut buf = [0u8; 16];
        let mut total = 0;
        while total < buf.len() {
            let n = root.read(&mut buf[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(&buf[..total], &payload[..16]);
        archive.storage_mut().rollback();
    }

    /// A pin file mirrors the committed tree head to local disk precisely so
    /// an object store that gets rolled back to an earlier snapshot (or
    /// replayed from a stale backup) can be told apart from one that's
    /// merely behind on the in-process `Integrity` state it was just
    /// constructed from.
    #[test]
    fn rollback_of_the_pinned_tree_head_is_detected_on_reopen() {
        use storage::integrity::TreeHead;
        use storage::{BlockStorage, HasState};

        let dir = tempfile::tempdir().unwrap();
        let mut config = ArchiveConfig::default();
        config.wal.db_path = dir.path().join("archive.sqlite3").to_str().unwrap().to_string();
        let pin_path = dir.path().join("tree.pin");
        config.integrity.pin_file = Some(pin_path.to_str().unwrap().to_string());
        config.block_file.num_ptrs = 4;
        config.block_file.data_size = 16;

        let store = Arc::new(MemoryObjectStore::new());
        let cancel = CancelToken::new();

        {
            let mut archive =
                Archive::open(Arc::clone(&store), b"hunter2", config.clone()).unwrap();
            let mut root = archive.root_file(&cancel).unwrap();
            root.write(b"hello").unwrap();
            drop(root);
            archive.storage_mut().commit().unwrap();
        }

        // A fresh `Integrity` (standing in for a restarted process) reloads
        // the tree head and leaf hashes from storage on its first `start`
        // without complaint.
        let mut archive = Archive::open(Arc::clone(&store), b"hunter2", config).unwrap();
        archive.storage_mut().start(&[], &cancel).unwrap();
        archive.storage_mut().rollback();

        // Something now replaces the pin file with a version this process
        // never committed — the signature doesn't even need to be valid,
        // since a version strictly ahead of what's in memory is rollback
        // evidence on its own.
        let forged = TreeHead {
            version: 999,
            leaf_count: 0,
            root_hash: [0u8; 32],
            tag: [0u8; 32],
        };
        std::fs::write(&pin_path, serde_json::to_vec(&forged).unwrap()).unwrap();

        let err = archive.storage_mut().start(&[], &cancel).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }
}
