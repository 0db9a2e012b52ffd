//! Remote groupware store contract
//!
//! The backup engine never looks inside a store, folder or item beyond
//! what these traits expose. Item payloads, permission/rule dumps and
//! store settings are opaque byte blobs produced and consumed by the
//! remote side.
//!
//! # Change feed
//!
//! [`RemoteFolder::sync`] replays every change since a [`Cursor`] into an
//! [`Importer`] and returns the new cursor. A `None` cursor replays the
//! whole folder. Cursors are compared for equality and persisted as text,
//! nothing else.

pub mod memory;

use crate::error::RemoteResult;
use chrono::{DateTime, Utc};
use std::fmt;

/// Opaque incremental-sync position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    /// Rebuild a cursor from its persisted encoding
    pub fn decode(encoded: &str) -> Self {
        Self(encoded.trim().to_string())
    }

    /// Stable external encoding (ASCII)
    pub fn encode(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open time range `[begin, end)`; a missing bound is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { begin, end }
    }

    /// Check whether a timestamp falls inside the window
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.begin.map_or(true, |b| time >= b) && self.end.map_or(true, |e| time < e)
    }

    /// True when neither bound is set
    pub fn is_unbounded(&self) -> bool {
        self.begin.is_none() && self.end.is_none()
    }
}

/// An item as seen through the change feed
pub trait RemoteItem {
    /// Server-assigned identifier, stable across moves
    fn sourcekey(&self) -> &str;

    fn subject(&self) -> Option<&str>;

    fn last_modified(&self) -> Option<DateTime<Utc>>;

    fn read_flag(&self) -> bool;

    /// Original sourcekey if this item was itself restored from a backup
    fn backup_origin(&self) -> Option<&str>;

    /// Serialize the full item into an opaque blob
    fn serialize(&self, with_attachments: bool) -> RemoteResult<Vec<u8>>;
}

/// Receiver of change-feed callbacks
///
/// Implementations must not fail the feed: item-level problems are
/// handled (and counted) inside the importer.
pub trait Importer {
    /// Item created or changed
    fn update(&mut self, item: &dyn RemoteItem);

    /// Only the read flag changed
    fn read(&mut self, sourcekey: &str, read: bool);

    /// Item removed
    fn delete(&mut self, sourcekey: &str);
}

/// Existing item in a target folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    /// Target-store identifier used for deletion and stamping
    pub id: String,
    pub sourcekey: String,
    pub backup_origin: Option<String>,
}

impl ItemRef {
    /// Key used to match an existing item against backup records
    pub fn origin_key(&self) -> &str {
        self.backup_origin.as_deref().unwrap_or(&self.sourcekey)
    }
}

/// A folder in a remote store
pub trait RemoteFolder {
    fn sourcekey(&self) -> &str;

    /// Logical path, `/`-separated, relative to the store root
    fn path(&self) -> &str;

    /// Sourcekey of the backed-up folder this one was restored from
    fn backup_origin(&self) -> RemoteResult<Option<String>>;

    fn set_backup_origin(&self, sourcekey: &str) -> RemoteResult<()>;

    /// Replay changes since `cursor` into `importer`, returning the new cursor
    fn sync(
        &self,
        importer: &mut dyn Importer,
        cursor: Option<&Cursor>,
        window: Option<&TimeWindow>,
    ) -> RemoteResult<Cursor>;

    fn properties_dump(&self) -> RemoteResult<Vec<u8>>;

    fn permissions_dump(&self) -> RemoteResult<Vec<u8>>;

    /// Rules are optional; folders without rules return `None`
    fn rules_dump(&self) -> RemoteResult<Option<Vec<u8>>>;

    fn load_permissions(&self, data: &[u8]) -> RemoteResult<()>;

    fn load_rules(&self, data: &[u8]) -> RemoteResult<()>;

    /// Every item currently in the folder
    fn items(&self) -> RemoteResult<Vec<ItemRef>>;

    /// Deserialize a blob and create it as a new item
    fn create_item(&self, blob: &[u8]) -> RemoteResult<ItemRef>;

    fn delete_item(&self, id: &str) -> RemoteResult<()>;

    fn set_item_backup_origin(&self, id: &str, sourcekey: &str) -> RemoteResult<()>;
}

/// A user's store (mail/calendar/contacts hierarchy)
pub trait RemoteStore {
    type Folder: RemoteFolder;

    fn name(&self) -> &str;

    /// Folders under the store root; `recursive = false` lists top level only
    fn folders(&self, recursive: bool) -> RemoteResult<Vec<Self::Folder>>;

    fn folder(&self, path: &str) -> RemoteResult<Option<Self::Folder>>;

    /// Create a folder, including missing parents; returns an existing one as is
    fn create_folder(&self, path: &str) -> RemoteResult<Self::Folder>;

    /// Move a folder (and its subtree) to a new logical path
    fn move_folder(&self, folder: &Self::Folder, path: &str) -> RemoteResult<Self::Folder>;

    /// Quota, out-of-office and webapp settings
    fn settings_dump(&self) -> RemoteResult<Vec<u8>>;

    fn user_dump(&self) -> RemoteResult<Vec<u8>>;

    fn delegates_dump(&self) -> RemoteResult<Vec<u8>>;

    fn permissions_dump(&self) -> RemoteResult<Vec<u8>>;

    fn load_settings(&self, data: &[u8]) -> RemoteResult<()>;

    fn load_delegates(&self, data: &[u8]) -> RemoteResult<()>;

    fn load_permissions(&self, data: &[u8]) -> RemoteResult<()>;
}

/// Opens stores by reference; shared by all backup workers
pub trait StoreProvider: Send + Sync {
    type Store: RemoteStore;

    fn open(&self, store_ref: &str) -> RemoteResult<Self::Store>;

    /// Size estimate used to schedule the largest stores first
    fn store_size(&self, _store_ref: &str) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_encoding() {
        let cursor = Cursor::decode("0000002a\n");
        assert_eq!(cursor.encode(), "0000002a");
        assert_eq!(cursor, Cursor::decode("0000002a"));
        assert_eq!(cursor.to_string(), "0000002a");
    }

    #[test]
    fn test_time_window_half_open() {
        let begin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(Some(begin), Some(end));

        assert!(window.contains(begin));
        assert!(!window.contains(end));
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()));
        assert!(TimeWindow::default().is_unbounded());
        assert!(TimeWindow::default().contains(end));
    }

    #[test]
    fn test_item_ref_origin_key() {
        let native = ItemRef {
            id: "1".into(),
            sourcekey: "AA".into(),
            backup_origin: None,
        };
        assert_eq!(native.origin_key(), "AA");

        let restored = ItemRef {
            backup_origin: Some("BB".into()),
            ..native
        };
        assert_eq!(restored.origin_key(), "BB");
    }
}
