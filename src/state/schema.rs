//! Folder state schema definitions
//!
//! Defines the index record, key encoding, item compression and the
//! RocksDB options used for the per-folder `items` and `index` stores.

use crate::error::{StateError, StateResult};
use chrono::{DateTime, Utc};
use rocksdb::Options;
use serde::{Deserialize, Serialize};

/// Reserved index key holding the folder-level tombstone.
/// Sourcekeys are uppercase hex, so this can never collide.
pub const FOLDER_KEY: &str = "folder";

/// zstd level for item payloads
const COMPRESSION_LEVEL: i32 = 3;

/// Metadata record stored per item in the `index` store
///
/// Every field is optional: a record written for a delete the backup never
/// saw, or for a read-state change inside a differential generation,
/// carries only the fields it knows. Merging overlays such partial
/// records onto complete ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub subject: Option<String>,
    /// Sourcekey the item had in the backup it was restored from
    pub orig_sourcekey: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Run that last wrote this record
    pub backup_updated: Option<DateTime<Utc>>,
    /// Present once a deletion was observed
    pub backup_deleted: Option<DateTime<Utc>>,
    pub read: Option<bool>,
}

impl IndexRecord {
    /// Record carrying only a deletion timestamp
    pub fn tombstone(deleted: DateTime<Utc>) -> Self {
        Self {
            backup_deleted: Some(deleted),
            ..Default::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.backup_deleted.is_some()
    }

    /// Shallow field-level overwrite: every field set in `newer` wins
    pub fn overlay(&mut self, newer: &IndexRecord) {
        if newer.subject.is_some() {
            self.subject = newer.subject.clone();
        }
        if newer.orig_sourcekey.is_some() {
            self.orig_sourcekey = newer.orig_sourcekey.clone();
        }
        if newer.last_modified.is_some() {
            self.last_modified = newer.last_modified;
        }
        if newer.backup_updated.is_some() {
            self.backup_updated = newer.backup_updated;
        }
        if newer.backup_deleted.is_some() {
            self.backup_deleted = newer.backup_deleted;
        }
        if newer.read.is_some() {
            self.read = newer.read;
        }
    }

    /// Serialize to bytes using bincode
    pub fn to_bytes(&self) -> StateResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StateError::Bincode(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StateError::Bincode(e.to_string()))
    }
}

/// Encode a sourcekey as a store key (ASCII bytes)
pub fn encode_key(sourcekey: &str) -> Vec<u8> {
    sourcekey.as_bytes().to_vec()
}

/// Decode a store key
pub fn decode_key(key: &[u8]) -> StateResult<String> {
    String::from_utf8(key.to_vec()).map_err(|e| StateError::InvalidKey(e.to_string()))
}

/// Compress a serialized item for the `items` store
pub fn compress_item(data: &[u8]) -> StateResult<Vec<u8>> {
    zstd::encode_all(data, COMPRESSION_LEVEL).map_err(|e| StateError::Compression(e.to_string()))
}

/// Decompress an `items` store value
pub fn decompress_item(data: &[u8]) -> StateResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| StateError::Compression(e.to_string()))
}

/// Options for an `items` store (large, already-compressed values)
pub fn items_options() -> Options {
    let mut opts = base_options();
    opts.set_write_buffer_size(16 * 1024 * 1024);
    opts.set_compression_type(rocksdb::DBCompressionType::None);
    opts
}

/// Options for an `index` store (small records, point lookups)
pub fn index_options() -> Options {
    let mut opts = base_options();
    opts.set_write_buffer_size(4 * 1024 * 1024);

    // Bloom filter for point lookups (10 bits/key)
    let mut block_opts = rocksdb::BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts
}

fn base_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_max_write_buffer_number(2);
    // One store pair per folder: keep file handles and threads modest
    opts.set_max_open_files(64);
    opts.set_max_background_jobs(2);
    opts.set_keep_log_file_num(2);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_overlay_keeps_unset_fields() {
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let deleted = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

        let mut base = IndexRecord {
            subject: Some("Quarterly report".into()),
            last_modified: Some(modified),
            backup_updated: Some(modified),
            read: Some(false),
            ..Default::default()
        };
        base.overlay(&IndexRecord::tombstone(deleted));

        assert_eq!(base.subject.as_deref(), Some("Quarterly report"));
        assert_eq!(base.last_modified, Some(modified));
        assert_eq!(base.backup_deleted, Some(deleted));
        assert!(base.is_deleted());
    }

    #[test]
    fn test_overlay_newer_fields_win() {
        let mut base = IndexRecord {
            subject: Some("old".into()),
            read: Some(false),
            ..Default::default()
        };
        base.overlay(&IndexRecord {
            subject: Some("new".into()),
            read: Some(true),
            ..Default::default()
        });
        assert_eq!(base.subject.as_deref(), Some("new"));
        assert_eq!(base.read, Some(true));
    }

    #[test]
    fn test_record_serialization() {
        let record = IndexRecord {
            subject: Some("Lunch".into()),
            orig_sourcekey: Some("00000000000000AB".into()),
            last_modified: Some(Utc.with_ymd_and_hms(2023, 12, 24, 18, 30, 0).unwrap()),
            backup_updated: None,
            backup_deleted: None,
            read: Some(true),
        };
        let decoded = IndexRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn test_item_compression() {
        let payload = b"Subject: hello\r\n\r\nhello hello hello hello".repeat(20);
        let compressed = compress_item(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress_item(&compressed).unwrap(), payload);
        assert!(decompress_item(b"not zstd").is_err());
    }

    #[test]
    fn test_key_encoding() {
        let key = encode_key("0123456789ABCDEF");
        assert_eq!(decode_key(&key).unwrap(), "0123456789ABCDEF");
        assert!(decode_key(&[0xff, 0xfe]).is_err());
    }
}
