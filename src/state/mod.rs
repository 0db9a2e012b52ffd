//! Per-folder backup state
//!
//! Each backed-up folder owns two RocksDB stores:
//!
//! - `items`: sourcekey -> zstd-compressed serialized item
//! - `index`: sourcekey -> bincode [`IndexRecord`] (subject, timestamps,
//!   read flag, deletion tombstone), plus the reserved `folder` key for
//!   folder-level tombstones
//!
//! # Module Structure
//!
//! - `schema`: Index record, key encoding, compression, store options
//! - `store`: Lazily opened store pair for one folder node
//! - `batch`: Pending write buffer flushed at a size threshold

pub mod batch;
pub mod schema;
pub mod store;

pub use batch::{PendingBatch, DEFAULT_FLUSH_THRESHOLD, MIN_FLUSH_THRESHOLD};
pub use schema::{compress_item, decompress_item, IndexRecord, FOLDER_KEY};
pub use store::{FolderState, KvStore};
