//! Incremental folder sync
//!
//! Drives a folder's change feed into its [`FolderState`]:
//!
//! - upserts: payload serialized, compressed and staged with its index
//!   record; flushed when the staged size crosses the threshold
//! - read changes: staged as partial records overlaid at commit
//! - deletes: written straight through, never batched
//!
//! Item-level failures are logged and counted; the feed keeps going and the
//! cursor still advances past them. Transport failures, whether returned by
//! the feed or hit while serializing an item, end the sync and leave the
//! caller's persisted cursor untouched.

use crate::error::{BackupError, RemoteError, Result, StateError};
use crate::remote::{Cursor, Importer, RemoteFolder, RemoteItem, TimeWindow};
use crate::state::{compress_item, FolderState, IndexRecord, PendingBatch};
use crate::stats::Stats;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

/// Per-folder sync settings
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub window: Option<TimeWindow>,
    pub flush_threshold: usize,
    pub with_attachments: bool,
}

/// [`Importer`] writing change-feed callbacks into a folder's state
pub struct FolderImporter<'a> {
    state: &'a mut FolderState,
    batch: PendingBatch,
    path: &'a str,
    now: DateTime<Utc>,
    with_attachments: bool,
    stats: Stats,
    /// First commit failure; once set, nothing more is written
    failed: Option<StateError>,
    /// Folder-level error hit inside a callback
    aborted: Option<RemoteError>,
}

impl<'a> FolderImporter<'a> {
    pub fn new(
        state: &'a mut FolderState,
        path: &'a str,
        options: &SyncOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state,
            batch: PendingBatch::new(options.flush_threshold),
            path,
            now,
            with_attachments: options.with_attachments,
            stats: Stats::default(),
            failed: None,
            aborted: None,
        }
    }

    fn stage_update(&mut self, item: &dyn RemoteItem) -> Result<()> {
        let data = item.serialize(self.with_attachments)?;
        let blob = compress_item(&data)?;
        let record = IndexRecord {
            subject: item.subject().map(str::to_string),
            orig_sourcekey: item.backup_origin().map(str::to_string),
            last_modified: item.last_modified(),
            backup_updated: Some(self.now),
            backup_deleted: None,
            read: Some(item.read_flag()),
        };
        self.batch.push_upsert(item.sourcekey(), blob, record);
        Ok(())
    }

    fn apply_delete(&mut self, sourcekey: &str) -> Result<()> {
        // A pending upsert must not resurrect the item at the next flush
        self.batch.discard(sourcekey);

        let mut record = self.state.get_record(sourcekey)?.unwrap_or_default();
        if record.backup_deleted.is_none() {
            record.backup_deleted = Some(self.now);
        }
        self.state.put_record(sourcekey, &record)?;
        self.state.delete_item(sourcekey)?;
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.failed.is_some() || self.aborted.is_some()
    }

    fn flush(&mut self) {
        if self.stopped() || self.batch.is_empty() {
            return;
        }
        match self.batch.commit(self.state) {
            Ok(count) => trace!(folder = %self.path, count, "Flushed pending writes"),
            Err(e) => {
                warn!(folder = %self.path, error = %e, "Failed to flush pending writes");
                self.failed = Some(e);
            }
        }
    }

    fn maybe_flush(&mut self) {
        if self.batch.should_flush() {
            self.flush();
        }
    }

    /// Flush what is left and return the folder's counters
    ///
    /// An aborted folder keeps the batches already committed but reports
    /// the error, so its cursor is not persisted.
    pub fn finish(mut self) -> Result<Stats> {
        if let Some(e) = self.aborted.take() {
            return Err(BackupError::Remote(e));
        }
        self.flush();
        match self.failed.take() {
            Some(e) => Err(BackupError::State(e)),
            None => Ok(self.stats),
        }
    }
}

impl Importer for FolderImporter<'_> {
    fn update(&mut self, item: &dyn RemoteItem) {
        if self.stopped() {
            return;
        }
        match self.stage_update(item) {
            Ok(()) => self.stats.changes += 1,
            Err(BackupError::Remote(e)) if !e.is_item_level() => {
                warn!(
                    folder = %self.path,
                    sourcekey = item.sourcekey(),
                    error = %e,
                    "Aborting folder sync"
                );
                self.aborted = Some(e);
                return;
            }
            Err(e) => {
                self.stats.errors += 1;
                warn!(
                    folder = %self.path,
                    sourcekey = item.sourcekey(),
                    error = %e,
                    "Skipping item"
                );
            }
        }
        self.maybe_flush();
    }

    fn read(&mut self, sourcekey: &str, read: bool) {
        if self.stopped() {
            return;
        }
        self.batch.push_read(sourcekey, read);
        self.stats.changes += 1;
        self.maybe_flush();
    }

    fn delete(&mut self, sourcekey: &str) {
        if self.stopped() {
            return;
        }
        match self.apply_delete(sourcekey) {
            Ok(()) => self.stats.deletes += 1,
            Err(e) => {
                self.stats.errors += 1;
                warn!(folder = %self.path, sourcekey, error = %e, "Failed to record deletion");
            }
        }
    }
}

/// Sync one folder from `cursor` into `state`, returning the new cursor
///
/// The caller decides whether to persist the cursor.
pub fn sync_folder<F: RemoteFolder>(
    folder: &F,
    state: &mut FolderState,
    cursor: Option<&Cursor>,
    options: &SyncOptions,
    now: DateTime<Utc>,
    stats: &mut Stats,
) -> Result<Cursor> {
    let path = folder.path();
    let mut importer = FolderImporter::new(state, path, options, now);
    let new_cursor = folder.sync(&mut importer, cursor, options.window.as_ref())?;
    let folder_stats = importer.finish()?;

    debug!(
        folder = %path,
        changes = folder_stats.changes,
        deletes = folder_stats.deletes,
        errors = folder_stats.errors,
        full = cursor.is_none(),
        "Folder synced"
    );
    *stats += folder_stats;
    Ok(new_cursor)
}
