//! Folding differential generations into the base tree
//!
//! Generations are applied strictly in chain order after [`Chain::verify`]
//! accepted the list. Per generation:
//!
//! - folders unknown to the base are copied in whole
//! - known folders get their index records overlaid field by field, item
//!   payloads overwritten, and flat metadata files replaced
//! - base folders the generation lists as removed are tombstoned with its
//!   run timestamp; a folder merely absent from the generation is left alone
//! - store-level metadata and the base `timestamp` are replaced
//!
//! The generations themselves are left on disk.

use crate::chain::{Chain, GenerationInfo};
use crate::error::{BackupError, ChainError, Result};
use crate::state::schema::encode_key;
use crate::state::FolderState;
use crate::tree::layout::{
    copy_dir_all, folder_dir, parse_timestamp, read_optional, write_file, FOLDERS_DIR,
    FOLDER_METADATA_FILES, RULES_FILE, STORE_METADATA_FILES, TIMESTAMP_FILE,
};
use crate::tree::{DirectoryIndex, TreeLock};
use rocksdb::WriteBatch;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// What a merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub generations: Vec<u32>,
    pub folders_added: u64,
    pub folders_updated: u64,
    pub folders_removed: u64,
    pub records_merged: u64,
}

/// Merge every unmerged generation into the base at `base`
pub fn run_merge(base: &Path) -> Result<MergeReport> {
    check_base(base)?;
    let chain = Chain::for_base(base)?;
    let _base_lock = TreeLock::acquire(base)?;
    let _chain_lock = TreeLock::acquire(chain.root())?;

    let pending = chain.pending()?;
    if pending.is_empty() {
        info!(base = %base.display(), "No generations to merge");
        return Ok(MergeReport::default());
    }
    merge_locked(&chain, &pending)
}

/// Merge exactly `generations`, which must continue the chain in order
pub fn merge_generations(base: &Path, generations: &[u32]) -> Result<MergeReport> {
    check_base(base)?;
    let chain = Chain::for_base(base)?;
    let _base_lock = TreeLock::acquire(base)?;
    let _chain_lock = TreeLock::acquire(chain.root())?;
    merge_locked(&chain, generations)
}

fn check_base(base: &Path) -> Result<()> {
    if !base.join(FOLDERS_DIR).is_dir() {
        return Err(BackupError::InvalidTree {
            path: base.to_path_buf(),
            reason: "not a backup tree (no folders directory)".into(),
        });
    }
    Ok(())
}

fn merge_locked(chain: &Chain, generations: &[u32]) -> Result<MergeReport> {
    let infos = chain.verify(generations)?;
    let mut report = MergeReport::default();

    for info in &infos {
        merge_one(chain, info, &mut report)?;
        chain.set_merged(info.generation)?;
        report.generations.push(info.generation);
        info!(
            base = %chain.base().display(),
            generation = info.generation,
            "Generation merged"
        );
    }
    Ok(report)
}

fn merge_one(chain: &Chain, info: &GenerationInfo, report: &mut MergeReport) -> Result<()> {
    let base = chain.base();
    let generation_dir = chain.generation_dir(info.generation);
    let generation_index = DirectoryIndex::build(&generation_dir)?;
    let base_index = DirectoryIndex::build(base)?;

    for entry in generation_index.entries() {
        match base_index.dir(&entry.sourcekey) {
            Some(base_dir) => {
                report.records_merged += merge_folder(&entry.dir, base_dir)?;
                report.folders_updated += 1;
            }
            None => {
                let target = folder_dir(base, &entry.sourcekey);
                // Leftover of an interrupted run; never indexed
                if target.exists() {
                    fs::remove_dir_all(&target)?;
                }
                copy_dir_all(&entry.dir, &target)?;
                report.folders_added += 1;
                debug!(folder = %entry.path, "Folder added from generation");
            }
        }
    }

    if !info.removed.is_empty() {
        let deleted = parse_timestamp(&info.timestamp).ok_or_else(|| {
            ChainError::InvalidMetadata {
                generation: info.generation,
                reason: format!("unreadable timestamp '{}'", info.timestamp),
            }
        })?;
        for sourcekey in &info.removed {
            let Some(entry) = base_index.get(sourcekey) else {
                continue;
            };
            let mut state = FolderState::open(&entry.dir);
            if state.set_folder_tombstone(deleted)? {
                report.folders_removed += 1;
                debug!(folder = %entry.path, "Folder tombstoned by generation");
            }
        }
    }

    for name in STORE_METADATA_FILES {
        if let Some(data) = read_optional(&generation_dir.join(name))? {
            write_file(&base.join(name), &data)?;
        }
    }
    write_file(&base.join(TIMESTAMP_FILE), info.timestamp.as_bytes())?;
    Ok(())
}

/// Overlay one generation folder node onto its base node
///
/// Returns the number of index records merged.
fn merge_folder(source: &Path, target: &Path) -> Result<u64> {
    let mut from = FolderState::open_read_only(source);
    let mut into = FolderState::open(target);

    let records = from.entries()?;
    let blobs = from.items_raw()?;
    let with_blob: HashSet<&str> = blobs.iter().map(|(key, _)| key.as_str()).collect();

    let mut items = WriteBatch::default();
    let mut index = WriteBatch::default();

    for (key, record) in &records {
        let merged = match into.get_record(key)? {
            Some(mut existing) => {
                existing.overlay(record);
                existing
            }
            None => record.clone(),
        };
        index.put(encode_key(key), merged.to_bytes()?);

        // Deletion recorded in the generation: drop the base payload too
        if record.is_deleted() && !with_blob.contains(key.as_str()) {
            items.delete(encode_key(key));
        }
    }
    for (key, blob) in &blobs {
        items.put(encode_key(key), blob);
    }
    into.write_batches(items, index)?;
    drop(into);

    for name in FOLDER_METADATA_FILES {
        match read_optional(&source.join(name))? {
            Some(data) => write_file(&target.join(name), &data)?,
            None if name == RULES_FILE => {
                if target.join(name).exists() {
                    fs::remove_file(target.join(name))?;
                }
            }
            None => {}
        }
    }
    Ok(records.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_store;
    use crate::config::BackupOptions;
    use crate::remote::memory::MemoryServer;
    use crate::state::IndexRecord;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn base_record(base: &Path, folder: &str, key: &str) -> Option<IndexRecord> {
        let index = DirectoryIndex::build(base).unwrap();
        let dir = index.dir(folder)?;
        FolderState::open_read_only(dir).get_record(key).unwrap()
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 7, 30, 0).unwrap()
    }

    fn differential() -> BackupOptions {
        BackupOptions {
            differential: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_applies_deletion_onto_base_record() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        let a = store.add_item("Inbox", "keep", b"a", t(1)).unwrap();
        let b = store.add_item("Inbox", "drop", b"b", t(1)).unwrap();
        let inbox = store.folder_sourcekey("Inbox").unwrap();

        backup_store(&store, &base, &BackupOptions::default(), t(2)).unwrap();
        store.remove_item("Inbox", &b).unwrap();
        store.set_read("Inbox", &a, true).unwrap();
        backup_store(&store, &base, &differential(), t(3)).unwrap();

        let report = run_merge(&base).unwrap();
        assert_eq!(report.generations, vec![1]);
        assert_eq!(report.folders_updated, 1);

        let dropped = base_record(&base, &inbox, &b).unwrap();
        assert_eq!(dropped.subject.as_deref(), Some("drop"));
        assert_eq!(dropped.backup_deleted, Some(t(3)));

        let kept = base_record(&base, &inbox, &a).unwrap();
        assert_eq!(kept.subject.as_deref(), Some("keep"));
        assert_eq!(kept.read, Some(true));

        let index = DirectoryIndex::build(&base).unwrap();
        let mut state = FolderState::open_read_only(index.dir(&inbox).unwrap());
        assert!(state.get_item(&b).unwrap().is_none());
        assert!(state.get_item(&a).unwrap().is_some());

        // Nothing left to merge
        assert!(run_merge(&base).unwrap().generations.is_empty());
    }

    #[test]
    fn test_merge_adds_and_tombstones_folders() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();
        store.add_item("Old", "o", b"o", t(1)).unwrap();
        let old = store.folder_sourcekey("Old").unwrap();

        backup_store(&store, &base, &BackupOptions::default(), t(2)).unwrap();
        store.remove_folder("Old").unwrap();
        store.add_item("New", "n", b"n", t(3)).unwrap();
        backup_store(&store, &base, &differential(), t(4)).unwrap();

        let report = run_merge(&base).unwrap();
        assert_eq!(report.folders_added, 1);
        assert_eq!(report.folders_removed, 1);

        let index = DirectoryIndex::build(&base).unwrap();
        assert!(index.resolve("New").is_some());
        let mut state = FolderState::open_read_only(index.dir(&old).unwrap());
        assert_eq!(state.folder_tombstone().unwrap(), Some(t(4)));
    }

    #[test]
    fn test_merge_keeps_folder_whose_feed_failed() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();
        store.add_item("Sent", "s", b"s", t(1)).unwrap();
        let inbox = store.folder_sourcekey("Inbox").unwrap();

        backup_store(&store, &base, &BackupOptions::default(), t(2)).unwrap();
        store.set_feed_down("Inbox", true).unwrap();
        let stats = backup_store(&store, &base, &differential(), t(3)).unwrap();
        assert_eq!(stats.errors, 1);

        let info = Chain::for_base(&base).unwrap().read_info(1).unwrap();
        assert!(info.removed.is_empty());

        let report = run_merge(&base).unwrap();
        assert_eq!(report.folders_removed, 0);
        let index = DirectoryIndex::build(&base).unwrap();
        let mut state = FolderState::open_read_only(index.dir(&inbox).unwrap());
        assert_eq!(state.folder_tombstone().unwrap(), None);
    }

    #[test]
    fn test_merge_rejects_reversed_list() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();

        backup_store(&store, &base, &BackupOptions::default(), t(2)).unwrap();
        backup_store(&store, &base, &differential(), t(3)).unwrap();
        backup_store(&store, &base, &differential(), t(4)).unwrap();

        let result = merge_generations(&base, &[2, 1]);
        assert!(matches!(
            result,
            Err(BackupError::Chain(ChainError::OutOfOrder { .. }))
        ));
        // Rejected before any change
        assert_eq!(Chain::for_base(&base).unwrap().merged().unwrap(), 0);
    }

    #[test]
    fn test_merge_requires_backup_tree() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            run_merge(&dir.path().join("missing")),
            Err(BackupError::InvalidTree { .. })
        ));
    }
}
