//! L7: `BlockFile`, a variable-length file built over a deterministic
//! skiplist of fixed-size blocks (§4.1). Block `i` in the chain always
//! carries, at slot `k ≥ 1`, a forward pointer to block `i + 2^k` once
//! that block has been created — maintained lazily, patched only at the
//! single ancestor exactly `2^k` blocks behind whenever a new tail makes
//! that ancestor's slot valid. `seek` always re-walks from the head,
//! picking the largest aligned stride that does not overshoot the target,
//! giving `O(log N)` block loads.

use std::io::SeekFrom;

use blockvault_format::{Block, BlockLayout, NIL_PTR};

use crate::error::{Error, Result};
use crate::storage::{BlockStorage, HasState};
use crate::types::{BlockPtr, CancelToken, DataType};

/// Whether a file's blocks carry their pointers and data together, or in
/// two separate physical blocks (§4.1, split-pointers mode). Splitting
/// lets a seek-heavy workload skip fetching data sub-blocks it never
/// reads — the skip itself isn't implemented yet (`fetch` always loads
/// both halves); only the on-disk layout is split so that optimization
/// can land later without a format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Combined,
    /// Pointers live at physical pointer `2p`, data at `2p + 1`.
    Split,
}

fn fetch_block<S: HasState>(
    storage: &mut S,
    layout: BlockLayout,
    addressing: Addressing,
    ptr: BlockPtr,
) -> Result<Block> {
    match addressing {
        Addressing::Combined => {
            let raw = storage.get(ptr)?;
            Block::unmarshal(layout, raw.as_ref()).map_err(|e| Error::Format { ptr, source: e })
        }
        Addressing::Split => {
            let ptrs_layout = BlockLayout {
                num_ptrs: layout.num_ptrs,
                data_size: 0,
            };
            let data_layout = BlockLayout {
                num_ptrs: 1,
                data_size: layout.data_size,
            };
            let ptrs_raw = storage.get(ptr * 2)?;
            let ptrs_block = Block::unmarshal(ptrs_layout, ptrs_raw.as_ref())
                .map_err(|e| Error::Format { ptr, source: e })?;
            let data_raw = storage.get(ptr * 2 + 1)?;
            let data_block = Block::unmarshal(data_layout, data_raw.as_ref())
                .map_err(|e| Error::Format { ptr, source: e })?;

            let mut combined = Block::empty(layout).map_err(|e| Error::Format { ptr, source: e })?;
            for k in 0..layout.num_ptrs {
                combined.set_ptr(k, ptrs_block.ptr(k));
            }
            combined
                .set_data(data_block.data())
                .map_err(|e| Error::Format { ptr, source: e })?;
            Ok(combined)
        }
    }
}

/// Allocates a pointer for a new block, reusing the head of the trash list
/// when one exists. `State::allocate` needs the reused block's own slot 0
/// value to advance the trash list, so this fetches it first rather than
/// handing `allocate` a closure that can't reach storage on its own.
fn allocate_ptr<S: HasState>(storage: &mut S, layout: BlockLayout, addressing: Addressing) -> Result<BlockPtr> {
    let trash_head = storage.state()?.trash_ptr;
    let trash_next = if trash_head == NIL_PTR {
        NIL_PTR
    } else {
        fetch_block(storage, layout, addressing, trash_head)?.ptr(0)
    };
    storage.state()?.allocate(|_| Ok(trash_next))
}

pub struct BlockFile<'a, S> {
    storage: &'a mut S,
    layout: BlockLayout,
    data_type: DataType,
    addressing: Addressing,
    head_ptr: BlockPtr,
    idx: u64,
    ptr: BlockPtr,
    block: Block,
    pos: u64,
}

impl<'a, S: HasState> BlockFile<'a, S> {
    fn ptrs_layout(&self) -> BlockLayout {
        BlockLayout {
            num_ptrs: self.layout.num_ptrs,
            data_size: 0,
        }
    }

    fn data_only_layout(&self) -> BlockLayout {
        BlockLayout {
            num_ptrs: 1,
            data_size: self.layout.data_size,
        }
    }

    fn fetch(&mut self, ptr: BlockPtr) -> Result<Block> {
        fetch_block(self.storage, self.layout, self.addressing, ptr)
    }

    fn persist_current(&mut self) -> Result<()> {
        match self.addressing {
            Addressing::Combined => {
                let bytes = self.block.marshal();
                self.storage.set(self.ptr, self.data_type, bytes.into())?;
            }
            Addressing::Split => {
                let mut ptrs_block = Block::empty(self.ptrs_layout())
                    .map_err(|e| Error::Format { ptr: self.ptr, source: e })?;
                for k in 0..self.layout.num_ptrs {
                    ptrs_block.set_ptr(k, self.block.ptr(k));
                }
                self.storage
                    .set(self.ptr * 2, DataType::Metadata, ptrs_block.marshal().into())?;

                let mut data_block = Block::empty(self.data_only_layout())
                    .map_err(|e| Error::Format { ptr: self.ptr, source: e })?;
                data_block
                    .set_data(self.block.data())
                    .map_err(|e| Error::Format { ptr: self.ptr, source: e })?;
                self.storage
                    .set(self.ptr * 2 + 1, self.data_type, data_block.marshal().into())?;
            }
        }
        Ok(())
    }

    /// Creates a brand new, empty one-block file and returns an open
    /// handle positioned at offset 0.
    pub fn create(
        storage: &'a mut S,
        layout: BlockLayout,
        data_type: DataType,
        addressing: Addressing,
    ) -> Result<Self> {
        let ptr = allocate_ptr(storage, layout, addressing)?;
        let block = Block::empty(layout).map_err(|e| Error::Format { ptr, source: e })?;
        let mut file = Self {
            storage,
            layout,
            data_type,
            addressing,
            head_ptr: ptr,
            idx: 0,
            ptr,
            block,
            pos: 0,
        };
        file.persist_current()?;
        Ok(file)
    }

    /// Opens an existing file by its head block's pointer.
    pub fn open(
        storage: &'a mut S,
        layout: BlockLayout,
        data_type: DataType,
        addressing: Addressing,
        head_ptr: BlockPtr,
    ) -> Result<Self> {
        let mut file = Self {
            storage,
            layout,
            data_type,
            addressing,
            head_ptr,
            idx: 0,
            ptr: head_ptr,
            block: Block::empty(layout).map_err(|e| Error::Format { ptr: head_ptr, source: e })?,
            pos: 0,
        };
        file.block = file.fetch(head_ptr)?;
        Ok(file)
    }

    pub fn head_ptr(&self) -> BlockPtr {
        self.head_ptr
    }

    /// Records this file's head pointer as the archive's root in `State`.
    /// Goes through this handle's own storage borrow rather than asking the
    /// caller to reach `State` through a second one.
    pub fn mark_as_root(&mut self) -> Result<()> {
        let head = self.head_ptr;
        self.storage.state()?.root_ptr = head;
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn data_size(&self) -> u64 {
        self.layout.data_size as u64
    }

    fn in_block_offset(&self) -> usize {
        (self.pos - self.idx * self.data_size()) as usize
    }

    fn seek_to_index(&mut self, target_idx: u64) -> Result<()> {
        self.ptr = self.head_ptr;
        self.block = self.fetch(self.head_ptr)?;
        self.idx = 0;
        while self.idx < target_idx {
            let remaining = target_idx - self.idx;
            let mut stepped = false;
            for k in (1..self.layout.num_ptrs).rev() {
                let stride = 1u64 << k;
                if stride <= remaining && self.idx % stride == 0 {
                    let next = self.block.ptr(k);
                    if next != NIL_PTR {
                        self.idx += stride;
                        self.ptr = next;
                        self.block = self.fetch(next)?;
                        stepped = true;
                        break;
                    }
                }
            }
            if !stepped {
                let next = self.block.ptr(0);
                if next == NIL_PTR {
                    return Err(Error::Other("seek target beyond end of file".into()));
                }
                self.idx += 1;
                self.ptr = next;
                self.block = self.fetch(next)?;
            }
        }
        Ok(())
    }

    /// Standard stream seek. `SeekFrom::End` requires the caller to supply
    /// the file's total length (this layer has no separate length field;
    /// callers track it the way a directory inode would).
    pub fn seek(&mut self, whence: SeekFrom, len_hint: u64) -> Result<u64> {
        let target = match whence {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => {
                let base = self.pos as i64;
                (base + delta).max(0) as u64
            }
            SeekFrom::End(delta) => {
                let base = len_hint as i64;
                (base + delta).max(0) as u64
            }
        };
        let target_idx = target / self.data_size();
        if target_idx != self.idx {
            self.seek_to_index(target_idx)?;
        }
        self.pos = target;
        Ok(self.pos)
    }

    /// Reads up to `buf.len()` bytes starting at the current position,
    /// returning the number of bytes actually read (0 at end of file).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let offset = self.in_block_offset();
            let available = self.block.data().len().saturating_sub(offset);
            if available == 0 {
                if self.block.ptr(0) == NIL_PTR {
                    break;
                }
                self.advance_to_next_block()?;
                continue;
            }
            let want = (buf.len() - total).min(available);
            buf[total..total + want].copy_from_slice(&self.block.data()[offset..offset + want]);
            total += want;
            self.pos += want as u64;
        }
        Ok(total)
    }

    fn advance_to_next_block(&mut self) -> Result<()> {
        let next = self.block.ptr(0);
        if next == NIL_PTR {
            return Err(Error::Other("attempted to advance past end of file".into()));
        }
        self.idx += 1;
        self.ptr = next;
        self.block = self.fetch(next)?;
        Ok(())
    }

    /// Writes `buf` at the current position, growing the file with new
    /// tail blocks as needed, and returns the number of bytes written
    /// (always `buf.len()` unless allocation fails).
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let offset = self.in_block_offset();
            let room = self.layout.data_size - offset;
            if room == 0 {
                self.append_new_tail()?;
                continue;
            }
            let want = (buf.len() - total).min(room);
            let mut data = self.block.data().to_vec();
            let needed_len = offset + want;
            if data.len() < needed_len {
                data.resize(needed_len, 0);
            }
            data[offset..offset + want].copy_from_slice(&buf[total..total + want]);
            self.block
                .set_data(&data)
                .map_err(|e| Error::Format { ptr: self.ptr, source: e })?;
            self.persist_current()?;
            total += want;
            self.pos += want as u64;
        }
        Ok(total)
    }

    fn append_new_tail(&mut self) -> Result<()> {
        let new_idx = self.idx + 1;
        let new_ptr = allocate_ptr(self.storage, self.layout, self.addressing)?;

        self.block.set_ptr(0, new_ptr);
        self.persist_current()?;

        for k in 1..self.layout.num_ptrs {
            let stride = 1u64 << k;
            if new_idx >= stride && new_idx % stride == 0 {
                let ancestor_idx = new_idx - stride;
                self.seek_to_index(ancestor_idx)?;
                self.block.set_ptr(k, new_ptr);
                self.persist_current()?;
            }
        }

        self.ptr = new_ptr;
        self.idx = new_idx;
        self.block = Block::empty(self.layout).map_err(|e| Error::Format { ptr: new_ptr, source: e })?;
        self.persist_current()?;
        self.pos = new_idx * self.data_size();
        Ok(())
    }

    /// Truncates the file to `new_len` bytes, reclaiming any blocks past
    /// the new end into the trash list.
    pub fn truncate(&mut self, new_len: u64) -> Result<()> {
        let new_last_idx = if new_len == 0 { 0 } else { (new_len - 1) / self.data_size() };

        for k in 1..self.layout.num_ptrs {
            let stride = 1u64 << k;
            let aligned = (new_last_idx / stride) * stride;
            if aligned != new_last_idx {
                self.seek_to_index(aligned)?;
                self.block.set_ptr(k, NIL_PTR);
                self.persist_current()?;
            }
        }

        self.seek_to_index(new_last_idx)?;
        let old_next = self.block.ptr(0);
        for k in 0..self.layout.num_ptrs {
            self.block.set_ptr(k, NIL_PTR);
        }
        let keep = ((new_len - new_last_idx * self.data_size()) as usize).min(self.block.data().len());
        let trimmed = self.block.data()[..keep].to_vec();
        self.block
            .set_data(&trimmed)
            .map_err(|e| Error::Format { ptr: self.ptr, source: e })?;
        self.persist_current()?;

        if old_next != NIL_PTR {
            self.unlink_from(old_next)?;
        }

        self.pos = self.pos.min(new_len);
        Ok(())
    }

    fn unlink_from(&mut self, start: BlockPtr) -> Result<()> {
        let mut cur = self.fetch(start)?;
        let mut cur_ptr = start;
        loop {
            let next = cur.ptr(0);
            if next == NIL_PTR {
                break;
            }
            cur_ptr = next;
            cur = self.fetch(next)?;
        }
        let old_trash = {
            let state = self.storage.state()?;
            let old_trash = state.trash_ptr;
            state.unlink(start);
            old_trash
        };
        cur.set_ptr(0, old_trash);
        match self.addressing {
            Addressing::Combined => {
                self.storage.set(cur_ptr, DataType::Metadata, cur.marshal().into())?;
            }
            Addressing::Split => {
                let mut ptrs_block = Block::empty(self.ptrs_layout())
                    .map_err(|e| Error::Format { ptr: cur_ptr, source: e })?;
                for k in 0..self.layout.num_ptrs {
                    ptrs_block.set_ptr(k, cur.ptr(k));
                }
                self.storage
                    .set(cur_ptr * 2, DataType::Metadata, ptrs_block.marshal().into())?;
            }
        }
        Ok(())
    }

    /// Reclaims every block of the file rooted at `head_ptr` into the
    /// trash list without needing an open handle.
    pub fn unlink(
        storage: &'a mut S,
        layout: BlockLayout,
        addressing: Addressing,
        head_ptr: BlockPtr,
    ) -> Result<()> {
        let mut file = Self::open(storage, layout, DataType::Unknown, addressing, head_ptr)?;
        file.unlink_from(head_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::app::AppStorage;
    use crate::storage::buffered::Buffered;
    use crate::storage::memory_object::MemoryObjectStore;
    use crate::storage::wal::LocalWal;
    use crate::types::CancelToken;
    use std::sync::Arc;

    type Stack = AppStorage<Buffered<LocalWal>>;

    fn fresh_stack(dir: &tempfile::TempDir, name: &str) -> Stack {
        let store = Arc::new(MemoryObjectStore::new());
        let wal = LocalWal::open(dir.path().join(name).to_str().unwrap(), 64, store).unwrap();
        AppStorage::new(Buffered::new(wal))
    }

    fn tiny_layout() -> BlockLayout {
        BlockLayout {
            num_ptrs: 4,
            data_size: 8,
        }
    }

    #[test]
    fn write_then_read_within_one_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "a.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let mut file = BlockFile::create(&mut stack, tiny_layout(), DataType::Content, Addressing::Combined).unwrap();
        file.write(b"hi").unwrap();
        file.seek(SeekFrom::Start(0), 2).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn write_spans_multiple_blocks_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "b.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = tiny_layout();
        let payload: Vec<u8> = (0u8..40).collect();
        let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Combined).unwrap();
        assert_eq!(file.write(&payload).unwrap(), payload.len());

        file.seek(SeekFrom::Start(0), payload.len() as u64).unwrap();
        let mut out = vec![0u8; payload.len()];
        let mut total = 0;
        while total < out.len() {
            let n = file.read(&mut out[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn seek_to_middle_block_lands_on_correct_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "c.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = tiny_layout();
        let payload: Vec<u8> = (0u8..64).collect();
        let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Combined).unwrap();
        file.write(&payload).unwrap();

        file.seek(SeekFrom::Start(20), payload.len() as u64).unwrap();
        let mut buf = [0u8; 4];
        file.read(&mut buf).unwrap();
        assert_eq!(buf, payload[20..24]);
    }

    #[test]
    fn truncate_shrinks_file_and_subsequent_reads_stop_at_new_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "d.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = tiny_layout();
        let payload: Vec<u8> = (0u8..32).collect();
        let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Combined).unwrap();
        file.write(&payload).unwrap();

        file.truncate(10).unwrap();
        file.seek(SeekFrom::Start(0), 10).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload[..10]);
    }

    #[test]
    fn unlink_reclaims_every_block_into_trash() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "e.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = tiny_layout();
        let payload: Vec<u8> = (0u8..40).collect();
        let head_ptr = {
            let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Combined).unwrap();
            file.write(&payload).unwrap();
            file.head_ptr()
        };
        BlockFile::unlink(&mut stack, layout, Addressing::Combined, head_ptr).unwrap();
        assert_ne!(stack.state().unwrap().trash_ptr, NIL_PTR);
    }

    #[test]
    fn split_addressing_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = fresh_stack(&dir, "f.sqlite3");
        let cancel = CancelToken::new();
        stack.start(&[], &cancel).unwrap();
        let layout = tiny_layout();
        let payload: Vec<u8> = (0u8..24).collect();
        let mut file = BlockFile::create(&mut stack, layout, DataType::Content, Addressing::Split).unwrap();
        file.write(&payload).unwrap();
        file.seek(SeekFrom::Start(0), payload.len() as u64).unwrap();
        let mut out = vec![0u8; payload.len()];
        let mut total = 0;
        while total < out.len() {
            let n = file.read(&mut out[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(out, payload);
    }
}
