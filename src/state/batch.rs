//! Pending write buffer
//!
//! Upserts and read-flag changes coming out of the change feed are staged
//! here and committed to a [`FolderState`] in one batch per store once the
//! buffered payload size crosses the flush threshold.

use crate::error::StateResult;
use crate::state::schema::{encode_key, IndexRecord};
use crate::state::store::FolderState;
use rocksdb::WriteBatch;
use std::collections::HashMap;

/// Default flush threshold (64 MiB of compressed payload)
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024 * 1024;

/// Lower bound accepted for a flush threshold
pub const MIN_FLUSH_THRESHOLD: usize = 4 * 1024;

/// One staged write
#[derive(Debug)]
struct PendingWrite {
    key: String,
    /// Compressed payload; `None` for read-flag changes
    item: Option<Vec<u8>>,
    record: IndexRecord,
    /// Replace the stored record instead of overlaying onto it
    replace: bool,
}

/// Ordered buffer of pending writes for one folder
#[derive(Debug)]
pub struct PendingBatch {
    threshold: usize,
    entries: Vec<Option<PendingWrite>>,
    positions: HashMap<String, usize>,
    bytes: usize,
}

impl PendingBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            entries: Vec::new(),
            positions: HashMap::new(),
            bytes: 0,
        }
    }

    /// Stage a full item write; a later upsert of the same key supersedes it
    pub fn push_upsert(&mut self, key: &str, compressed: Vec<u8>, record: IndexRecord) {
        self.bytes += compressed.len() + key.len();
        let write = PendingWrite {
            key: key.to_string(),
            item: Some(compressed),
            record,
            replace: true,
        };
        self.stage(write);
    }

    /// Stage a read-flag change
    pub fn push_read(&mut self, key: &str, read: bool) {
        if let Some(&index) = self.positions.get(key) {
            if let Some(pending) = self.entries[index].as_mut() {
                pending.record.read = Some(read);
                return;
            }
        }
        self.bytes += key.len();
        let write = PendingWrite {
            key: key.to_string(),
            item: None,
            record: IndexRecord {
                read: Some(read),
                ..Default::default()
            },
            replace: false,
        };
        self.stage(write);
    }

    fn stage(&mut self, write: PendingWrite) {
        match self.positions.get(&write.key) {
            Some(&index) => self.entries[index] = Some(write),
            None => {
                self.positions.insert(write.key.clone(), self.entries.len());
                self.entries.push(Some(write));
            }
        }
    }

    /// Drop any staged write for `key`; returns true if one was pending
    pub fn discard(&mut self, key: &str) -> bool {
        match self.positions.remove(key) {
            Some(index) => self.entries[index].take().is_some(),
            None => false,
        }
    }

    pub fn should_flush(&self) -> bool {
        self.bytes >= self.threshold
    }

    /// Number of staged writes
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Write everything staged to `state` and reset the buffer
    ///
    /// Returns the number of writes committed.
    pub fn commit(&mut self, state: &mut FolderState) -> StateResult<usize> {
        let entries = std::mem::take(&mut self.entries);
        self.positions.clear();
        self.bytes = 0;

        let mut items = WriteBatch::default();
        let mut index = WriteBatch::default();
        let mut count = 0;

        for write in entries.into_iter().flatten() {
            let record = if write.replace {
                write.record
            } else {
                let mut existing = state.get_record(&write.key)?.unwrap_or_default();
                existing.overlay(&write.record);
                existing
            };

            let key = encode_key(&write.key);
            index.put(&key, record.to_bytes()?);
            if let Some(blob) = write.item {
                items.put(&key, blob);
            }
            count += 1;
        }

        if count > 0 {
            state.write_batches(items, index)?;
        }
        Ok(count)
    }
}
