//! Restoring a backup tree into a target store
//!
//! Trees are applied oldest first: the base, then (for a differential
//! restore) every unmerged generation. Per selected folder:
//!
//! 1. find the target folder by its backup-origin marker, moving it if its
//!    path changed, or create it and stamp the marker
//! 2. index the target's existing items by origin sourcekey, once
//! 3. replay the selected records under the deletion, window and
//!    duplicate policies
//!
//! Folder ACLs and rules follow once all items are in; store-level
//! settings only for a full restore.

use crate::chain::Chain;
use crate::config::{DeletionPolicy, DuplicatePolicy, RestoreOptions};
use crate::error::{BackupError, Result};
use crate::remote::{RemoteFolder, RemoteStore};
use crate::state::{decompress_item, FolderState, IndexRecord};
use crate::stats::Stats;
use crate::tree::layout::{
    read_optional, ACL_FILE, DELEGATES_FILE, FOLDERS_DIR, RULES_FILE, STORE_FILE,
};
use crate::tree::{DirectoryIndex, FolderEntry, TreeLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of restoring one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemAction {
    Created,
    Deleted,
    Skipped,
    Duplicate,
}

/// Restore the tree at `backup` into `target`
pub fn run_restore<S: RemoteStore>(
    backup: &Path,
    target: &S,
    options: &RestoreOptions,
) -> Result<Stats> {
    options.validate()?;
    if !backup.join(FOLDERS_DIR).is_dir() {
        return Err(BackupError::InvalidTree {
            path: backup.to_path_buf(),
            reason: "not a backup tree (no folders directory)".into(),
        });
    }

    let start = Instant::now();
    let chain = Chain::for_base(backup)?;
    let _base_lock = TreeLock::acquire(backup)?;

    let mut trees: Vec<(PathBuf, bool)> = vec![(backup.to_path_buf(), false)];
    let _chain_lock = if options.differential && chain.root().is_dir() {
        let lock = TreeLock::acquire(chain.root())?;
        for generation in chain.pending()? {
            trees.push((chain.generation_dir(generation), true));
        }
        Some(lock)
    } else {
        None
    };

    info!(
        backup = %backup.display(),
        store = target.name(),
        trees = trees.len(),
        "Starting restore"
    );

    let sourcekeys: HashSet<&str> = options.sourcekeys.iter().map(String::as_str).collect();
    let mut stats = Stats::default();
    // Newest node per folder, for the metadata pass
    let mut restored: BTreeMap<String, (S::Folder, PathBuf)> = BTreeMap::new();

    for (tree, is_generation) in &trees {
        let index = DirectoryIndex::build(tree)?;
        for entry in index.select(&options.folders, options.recursive) {
            match restore_folder(target, entry, *is_generation, &sourcekeys, options, &mut stats) {
                Ok(Some(folder)) => {
                    restored.insert(entry.sourcekey.clone(), (folder, entry.dir.clone()));
                }
                Ok(None) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(folder = %entry.path, error = %e, "Folder restore failed");
                }
            }
        }
    }

    for (folder, dir) in restored.values() {
        if let Err(e) = restore_folder_metadata(folder, dir) {
            stats.errors += 1;
            warn!(folder = %folder.path(), error = %e, "Failed to restore folder metadata");
        }
    }

    if options.restores_store_metadata() {
        if let Err(e) = restore_store_metadata(target, &trees) {
            stats.errors += 1;
            warn!(store = target.name(), error = %e, "Failed to restore store settings");
        }
    }

    info!(
        store = target.name(),
        changes = stats.changes,
        deletes = stats.deletes,
        skipped = stats.skipped,
        errors = stats.errors,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Restore complete"
    );
    Ok(stats)
}

fn restore_folder<S: RemoteStore>(
    target: &S,
    entry: &FolderEntry,
    is_generation: bool,
    sourcekeys: &HashSet<&str>,
    options: &RestoreOptions,
    stats: &mut Stats,
) -> Result<Option<S::Folder>> {
    let mut state = FolderState::open_read_only(&entry.dir);

    if state.folder_tombstone()?.is_some() && options.deletes == DeletionPolicy::Omit {
        debug!(folder = %entry.path, "Skipping deleted folder");
        return Ok(None);
    }

    let folder = locate_folder(target, &entry.sourcekey, &options.target_path(&entry.path))?;
    let mut existing: HashMap<String, String> = folder
        .items()?
        .into_iter()
        .map(|item| (item.origin_key().to_string(), item.id))
        .collect();

    let duplicates = if is_generation {
        DuplicatePolicy::Overwrite
    } else {
        options.duplicates
    };

    for (key, record) in state.records()? {
        if !sourcekeys.is_empty() && !sourcekeys.contains(key.as_str()) {
            continue;
        }
        let action = restore_item(
            &folder,
            &mut state,
            &key,
            &record,
            &mut existing,
            options,
            duplicates,
        );
        match action {
            Ok(ItemAction::Created) => stats.changes += 1,
            Ok(ItemAction::Deleted) => stats.deletes += 1,
            Ok(ItemAction::Skipped) => stats.skipped += 1,
            Ok(ItemAction::Duplicate) => {
                stats.skipped += 1;
                warn!(folder = %folder.path(), sourcekey = %key, "Item already restored, skipping");
            }
            Err(e) => {
                stats.errors += 1;
                warn!(folder = %folder.path(), sourcekey = %key, error = %e, "Failed to restore item");
            }
        }
    }
    Ok(Some(folder))
}

/// Find the folder previously restored from `sourcekey`, or create it
fn locate_folder<S: RemoteStore>(target: &S, sourcekey: &str, path: &str) -> Result<S::Folder> {
    for folder in target.folders(true)? {
        if folder.backup_origin()?.as_deref() != Some(sourcekey) {
            continue;
        }
        if folder.path() == path {
            return Ok(folder);
        }
        info!(from = %folder.path(), to = %path, "Moving restored folder");
        return Ok(target.move_folder(&folder, path)?);
    }

    let folder = match target.folder(path)? {
        Some(folder) => folder,
        None => target.create_folder(path)?,
    };
    if folder.backup_origin()?.is_none() {
        folder.set_backup_origin(sourcekey)?;
    }
    Ok(folder)
}

fn restore_item<F: RemoteFolder>(
    folder: &F,
    state: &mut FolderState,
    key: &str,
    record: &IndexRecord,
    existing: &mut HashMap<String, String>,
    options: &RestoreOptions,
    duplicates: DuplicatePolicy,
) -> Result<ItemAction> {
    let blob = state.get_item(key)?;

    if record.is_deleted() {
        match (blob.is_some(), options.deletes) {
            (false, DeletionPolicy::Include) => {
                return match existing.remove(key) {
                    Some(id) => {
                        folder.delete_item(&id)?;
                        Ok(ItemAction::Deleted)
                    }
                    None => {
                        warn!(folder = %folder.path(), sourcekey = key, "Deleted item already gone");
                        Ok(ItemAction::Skipped)
                    }
                };
            }
            (_, DeletionPolicy::Omit) => return Ok(ItemAction::Skipped),
            (true, DeletionPolicy::Include) => {}
        }
    }

    if let (Some(window), Some(modified)) = (&options.window, record.last_modified) {
        if !window.contains(modified) {
            return Ok(ItemAction::Skipped);
        }
    }

    // Read-flag-only records in a generation carry no payload
    let Some(blob) = blob else {
        return Ok(ItemAction::Skipped);
    };

    let found = existing.get(key).or_else(|| {
        record
            .orig_sourcekey
            .as_deref()
            .and_then(|origin| existing.get(origin))
    });
    if let Some(id) = found.cloned() {
        match duplicates {
            DuplicatePolicy::Skip => return Ok(ItemAction::Duplicate),
            DuplicatePolicy::Overwrite => {
                folder.delete_item(&id)?;
                existing.retain(|_, v| *v != id);
            }
        }
    }

    let data = decompress_item(&blob)?;
    let created = folder.create_item(&data)?;
    if created.backup_origin.is_none() {
        folder.set_item_backup_origin(&created.id, key)?;
    }
    existing.insert(key.to_string(), created.id);
    Ok(ItemAction::Created)
}

fn restore_folder_metadata<F: RemoteFolder>(folder: &F, dir: &Path) -> Result<()> {
    if let Some(acl) = read_optional(&dir.join(ACL_FILE))? {
        folder.load_permissions(&acl)?;
    }
    if let Some(rules) = read_optional(&dir.join(RULES_FILE))? {
        folder.load_rules(&rules)?;
    }
    Ok(())
}

/// Newest copy of each store-level blob wins
fn restore_store_metadata<S: RemoteStore>(target: &S, trees: &[(PathBuf, bool)]) -> Result<()> {
    let newest = |name: &str| -> Result<Option<Vec<u8>>> {
        for (tree, _) in trees.iter().rev() {
            if let Some(data) = read_optional(&tree.join(name))? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    };

    if let Some(settings) = newest(STORE_FILE)? {
        target.load_settings(&settings)?;
    }
    if let Some(delegates) = newest(DELEGATES_FILE)? {
        target.load_delegates(&delegates)?;
    }
    if let Some(acl) = newest(ACL_FILE)? {
        target.load_permissions(&acl)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_store;
    use crate::config::BackupOptions;
    use crate::remote::memory::MemoryServer;
    use crate::remote::TimeWindow;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 10, 0, 0).unwrap()
    }

    fn backed_up(server: &MemoryServer, base: &Path) {
        let store = server.add_store("alice");
        store.add_item("Inbox", "one", b"1", t(1)).unwrap();
        store.add_item("Inbox", "two", b"2", t(5)).unwrap();
        store.add_item("Inbox/Work", "three", b"3", t(9)).unwrap();
        store.set_folder_permissions("Inbox", b"bob:read").unwrap();
        store
            .set_store_blobs(b"oof=on", b"alice", b"carol", b"admin")
            .unwrap();
        backup_store(&store, base, &BackupOptions::default(), t(10)).unwrap();
    }

    #[test]
    fn test_full_restore_into_empty_store() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        backed_up(&server, &base);

        let target = server.add_store("restore");
        let stats = run_restore(&base, &target, &RestoreOptions::default()).unwrap();
        assert_eq!(stats.changes, 3);
        assert_eq!(stats.errors, 0);
        assert_eq!(target.subjects("Inbox"), vec!["one", "two"]);
        assert_eq!(target.subjects("Inbox/Work"), vec!["three"]);
        assert_eq!(target.folder_permissions("Inbox").unwrap(), b"bob:read");
        assert_eq!(target.store_blobs().0, b"oof=on");
    }

    #[test]
    fn test_window_and_folder_selection() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        backed_up(&server, &base);

        let target = server.add_store("restore");
        let options = RestoreOptions {
            folders: vec!["Inbox".into()],
            recursive: false,
            window: Some(TimeWindow::new(Some(t(2)), None)),
            ..Default::default()
        };
        let stats = run_restore(&base, &target, &options).unwrap();
        assert_eq!(stats.changes, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(target.subjects("Inbox"), vec!["two"]);
        assert!(target.folder_sourcekey("Inbox/Work").is_none());
        // Partial restore leaves store settings alone
        assert!(target.store_blobs().0.is_empty());
    }

    #[test]
    fn test_restore_root() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        backed_up(&server, &base);

        let target = server.add_store("restore");
        let options = RestoreOptions {
            restore_root: Some("Recovered".into()),
            ..Default::default()
        };
        run_restore(&base, &target, &options).unwrap();
        assert_eq!(target.subjects("Recovered/Inbox/Work"), vec!["three"]);
    }

    #[test]
    fn test_duplicates_skipped_then_overwritten() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        backed_up(&server, &base);

        let target = server.add_store("restore");
        run_restore(&base, &target, &RestoreOptions::default()).unwrap();

        let again = run_restore(&base, &target, &RestoreOptions::default()).unwrap();
        assert_eq!(again.changes, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(target.item_count("Inbox"), 2);

        let overwrite = RestoreOptions {
            duplicates: DuplicatePolicy::Overwrite,
            ..Default::default()
        };
        let stats = run_restore(&base, &target, &overwrite).unwrap();
        assert_eq!(stats.changes, 3);
        assert_eq!(target.item_count("Inbox"), 2);
    }

    #[test]
    fn test_moved_folder_followed_by_origin() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        let server = MemoryServer::new();
        backed_up(&server, &base);

        let target = server.add_store("restore");
        run_restore(&base, &target, &RestoreOptions::default()).unwrap();
        let work = target.folder("Inbox/Work").unwrap().unwrap();
        target.move_folder(&work, "Elsewhere").unwrap();

        let again = run_restore(&base, &target, &RestoreOptions::default()).unwrap();
        assert_eq!(again.changes, 0);
        assert_eq!(target.subjects("Inbox/Work"), vec!["three"]);
        assert!(target.folder_sourcekey("Elsewhere").is_none());
    }

    #[test]
    fn test_missing_tree_rejected() {
        let dir = tempdir().unwrap();
        let server = MemoryServer::new();
        let target = server.add_store("restore");
        let result = run_restore(&dir.path().join("absent"), &target, &RestoreOptions::default());
        assert!(matches!(result, Err(BackupError::InvalidTree { .. })));
    }
}
