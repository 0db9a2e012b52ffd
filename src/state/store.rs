//! Per-folder key-value stores
//!
//! Every folder node carries two RocksDB stores, `items` (sourcekey ->
//! compressed item) and `index` (sourcekey -> [`IndexRecord`]). They are
//! opened lazily on first access and closed when the [`FolderState`] is
//! dropped, so every exit path releases them.

use crate::error::{StateError, StateResult};
use crate::state::schema::{
    decode_key, decompress_item, encode_key, index_options, items_options, IndexRecord,
    FOLDER_KEY,
};
use crate::tree::layout::{INDEX_DB, ITEMS_DB};
use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};

/// A single RocksDB key-value store
pub struct KvStore {
    db: DB,
}

impl KvStore {
    /// Open or create a store
    pub fn open<P: AsRef<Path>>(path: P, opts: &Options) -> StateResult<Self> {
        let db = DB::open(opts, path)?;
        Ok(Self { db })
    }

    /// Open an existing store for reading
    pub fn open_read_only<P: AsRef<Path>>(path: P, opts: &Options) -> StateResult<Self> {
        let db = DB::open_for_read_only(opts, path, false)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.db.get(encode_key(key))?)
    }

    pub fn put(&self, key: &str, value: &[u8]) -> StateResult<()> {
        Ok(self.db.put(encode_key(key), value)?)
    }

    pub fn delete(&self, key: &str) -> StateResult<()> {
        Ok(self.db.delete(encode_key(key))?)
    }

    /// Apply a batch atomically
    pub fn write(&self, batch: WriteBatch) -> StateResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        Ok(self.db.write(batch)?)
    }

    /// All pairs in key order
    pub fn entries(&self) -> StateResult<Vec<(String, Vec<u8>)>> {
        self.db
            .iterator(IteratorMode::Start)
            .map(|result| {
                let (key, value) = result?;
                Ok((decode_key(&key)?, value.to_vec()))
            })
            .collect()
    }

    /// Count keys (by iterating - O(n))
    pub fn count(&self) -> StateResult<u64> {
        let mut count = 0u64;
        for result in self.db.iterator(IteratorMode::Start) {
            result?;
            count += 1;
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

/// The `items` and `index` stores of one folder node
pub struct FolderState {
    dir: PathBuf,
    access: Access,
    items: Option<KvStore>,
    index: Option<KvStore>,
}

impl FolderState {
    /// Open a folder node for writing; stores are created on first use
    pub fn open<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            access: Access::ReadWrite,
            items: None,
            index: None,
        }
    }

    /// Open a folder node for reading; missing stores read as empty
    pub fn open_read_only<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            access: Access::ReadOnly,
            ..Self::open(dir)
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open_store(&self, name: &str, opts: &Options) -> StateResult<Option<KvStore>> {
        let path = self.dir.join(name);
        match self.access {
            Access::ReadWrite => KvStore::open(&path, opts).map(Some),
            Access::ReadOnly if path.exists() => KvStore::open_read_only(&path, opts).map(Some),
            Access::ReadOnly => Ok(None),
        }
    }

    fn items(&mut self) -> StateResult<Option<&KvStore>> {
        if self.items.is_none() {
            self.items = self.open_store(ITEMS_DB, &items_options())?;
        }
        Ok(self.items.as_ref())
    }

    fn index(&mut self) -> StateResult<Option<&KvStore>> {
        if self.index.is_none() {
            self.index = self.open_store(INDEX_DB, &index_options())?;
        }
        Ok(self.index.as_ref())
    }

    fn writable_items(&mut self) -> StateResult<&KvStore> {
        let dir = self.dir.clone();
        self.items()?.ok_or(StateError::ReadOnly(dir))
    }

    fn writable_index(&mut self) -> StateResult<&KvStore> {
        let dir = self.dir.clone();
        self.index()?.ok_or(StateError::ReadOnly(dir))
    }

    pub fn get_record(&mut self, key: &str) -> StateResult<Option<IndexRecord>> {
        match self.index()? {
            Some(index) => index
                .get(key)?
                .map(|bytes| IndexRecord::from_bytes(&bytes))
                .transpose(),
            None => Ok(None),
        }
    }

    pub fn put_record(&mut self, key: &str, record: &IndexRecord) -> StateResult<()> {
        let bytes = record.to_bytes()?;
        self.writable_index()?.put(key, &bytes)
    }

    pub fn delete_record(&mut self, key: &str) -> StateResult<()> {
        self.writable_index()?.delete(key)
    }

    /// Every index entry, including the folder tombstone
    pub fn entries(&mut self) -> StateResult<Vec<(String, IndexRecord)>> {
        match self.index()? {
            Some(index) => index
                .entries()?
                .into_iter()
                .map(|(key, bytes)| Ok((key, IndexRecord::from_bytes(&bytes)?)))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Item records only (the folder tombstone is left out)
    pub fn records(&mut self) -> StateResult<Vec<(String, IndexRecord)>> {
        let mut entries = self.entries()?;
        entries.retain(|(key, _)| key != FOLDER_KEY);
        Ok(entries)
    }

    /// Stored (compressed) payload of an item
    pub fn get_item(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        match self.items()? {
            Some(items) => items.get(key),
            None => Ok(None),
        }
    }

    /// Decompressed payload of an item
    pub fn load_item(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.get_item(key)?
            .map(|blob| decompress_item(&blob))
            .transpose()
    }

    pub fn put_item(&mut self, key: &str, compressed: &[u8]) -> StateResult<()> {
        self.writable_items()?.put(key, compressed)
    }

    /// Remove an item payload; absent keys are not an error
    pub fn delete_item(&mut self, key: &str) -> StateResult<()> {
        self.writable_items()?.delete(key)
    }

    /// Every stored payload (compressed) in key order
    pub fn items_raw(&mut self) -> StateResult<Vec<(String, Vec<u8>)>> {
        match self.items()? {
            Some(items) => items.entries(),
            None => Ok(Vec::new()),
        }
    }

    pub fn item_count(&mut self) -> StateResult<u64> {
        match self.items()? {
            Some(items) => items.count(),
            None => Ok(0),
        }
    }

    /// Deletion time of the whole folder, if tombstoned
    pub fn folder_tombstone(&mut self) -> StateResult<Option<DateTime<Utc>>> {
        Ok(self
            .get_record(FOLDER_KEY)?
            .and_then(|record| record.backup_deleted))
    }

    /// Tombstone the folder unless it already is; returns true if written
    pub fn set_folder_tombstone(&mut self, deleted: DateTime<Utc>) -> StateResult<bool> {
        if self.folder_tombstone()?.is_some() {
            return Ok(false);
        }
        self.put_record(FOLDER_KEY, &IndexRecord::tombstone(deleted))?;
        Ok(true)
    }

    /// Write one batch to each store, items first
    pub fn write_batches(&mut self, items: WriteBatch, index: WriteBatch) -> StateResult<()> {
        self.writable_items()?.write(items)?;
        self.writable_index()?.write(index)
    }
}
