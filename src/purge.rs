//! Age-based purge of tombstoned folders and items

use crate::error::{BackupError, Result};
use crate::state::FolderState;
use crate::stats::PurgeStats;
use crate::tree::layout::FOLDERS_DIR;
use crate::tree::{DirectoryIndex, TreeLock};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Remove everything in `backup` deleted more than `age_days` before `now`
///
/// A tombstoned folder is either removed whole or left alone; its items
/// are never purged one by one.
pub fn run_purge(backup: &Path, age_days: u32, now: DateTime<Utc>) -> Result<PurgeStats> {
    if !backup.join(FOLDERS_DIR).is_dir() {
        return Err(BackupError::InvalidTree {
            path: backup.to_path_buf(),
            reason: "not a backup tree (no folders directory)".into(),
        });
    }
    let _lock = TreeLock::acquire(backup)?;

    let threshold = Duration::days(i64::from(age_days));
    let expired = |deleted: DateTime<Utc>| now - deleted > threshold;

    let index = DirectoryIndex::build(backup)?;
    let mut stats = PurgeStats::default();

    for entry in index.entries() {
        // Gone with a purged ancestor
        if !entry.dir.exists() {
            continue;
        }

        let mut state = FolderState::open(&entry.dir);
        if let Some(deleted) = state.folder_tombstone()? {
            if expired(deleted) {
                drop(state);
                fs::remove_dir_all(&entry.dir)?;
                stats.folders_removed += 1;
                debug!(folder = %entry.path, %deleted, "Purged folder");
            }
            continue;
        }

        for (key, record) in state.records()? {
            let Some(deleted) = record.backup_deleted else {
                continue;
            };
            if expired(deleted) {
                state.delete_record(&key)?;
                state.delete_item(&key)?;
                stats.items_removed += 1;
            }
        }
    }

    info!(
        backup = %backup.display(),
        age_days,
        folders_removed = stats.folders_removed,
        items_removed = stats.items_removed,
        "Purge complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IndexRecord;
    use crate::tree::layout::{folder_dir, PATH_FILE};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn node(root: &Path, sourcekey: &str, path: &str) -> std::path::PathBuf {
        let dir = folder_dir(root, sourcekey);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PATH_FILE), path).unwrap();
        dir
    }

    #[test]
    fn test_item_boundary() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 8, 31, 12, 0, 0).unwrap();
        let inbox = node(dir.path(), "AA", "Inbox");
        {
            let mut state = FolderState::open(&inbox);
            state
                .put_record("EXACT", &IndexRecord::tombstone(now - Duration::days(30)))
                .unwrap();
            state
                .put_record("OLDER", &IndexRecord::tombstone(now - Duration::days(31)))
                .unwrap();
            state.put_record("LIVE", &IndexRecord::default()).unwrap();
        }

        let stats = run_purge(dir.path(), 30, now).unwrap();
        assert_eq!(stats.items_removed, 1);
        assert_eq!(stats.folders_removed, 0);

        let mut state = FolderState::open_read_only(&inbox);
        assert!(state.get_record("EXACT").unwrap().is_some());
        assert!(state.get_record("OLDER").unwrap().is_none());
        assert!(state.get_record("LIVE").unwrap().is_some());
    }

    #[test]
    fn test_folder_removed_with_subtree() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 8, 31, 12, 0, 0).unwrap();
        let old = node(dir.path(), "AA", "Old");
        node(&old, "AB", "Old/Child");
        {
            let mut state = FolderState::open(&old);
            state.set_folder_tombstone(now - Duration::days(90)).unwrap();
        }

        let stats = run_purge(dir.path(), 30, now).unwrap();
        assert_eq!(stats.folders_removed, 1);
        assert!(!old.exists());
        assert!(DirectoryIndex::build(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_recent_folder_tombstone_keeps_items() {
        let dir = tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 8, 31, 12, 0, 0).unwrap();
        let recent = node(dir.path(), "AA", "Recent");
        {
            let mut state = FolderState::open(&recent);
            state.set_folder_tombstone(now - Duration::days(1)).unwrap();
            state
                .put_record("ANCIENT", &IndexRecord::tombstone(now - Duration::days(400)))
                .unwrap();
        }

        let stats = run_purge(dir.path(), 30, now).unwrap();
        assert_eq!(stats, PurgeStats::default());
        let mut state = FolderState::open_read_only(&recent);
        assert!(state.get_record("ANCIENT").unwrap().is_some());
    }
}
