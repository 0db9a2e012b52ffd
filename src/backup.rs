//! Backup of one store
//!
//! Runs under the base tree's lock (and the chain root's lock for a
//! differential run):
//!
//! 1. plan the write target (base, or the next generation)
//! 2. dump store-level metadata (whole-store runs only)
//! 3. sync every selected remote folder, resuming from the newest cursor
//!    found in the read trees
//! 4. tombstone base folders that vanished remotely (base, whole-store), or
//!    list them in the generation metadata (differential, whole-store)
//! 5. stamp the run timestamp and, for a generation, its chain metadata
//!
//! A folder whose feed fails is abandoned for this run and counted as an
//! error; the store job carries on with the next folder.

use crate::chain::{BackupPlan, Chain};
use crate::config::BackupOptions;
use crate::error::{FolderOutcome, Result};
use crate::remote::{RemoteFolder, RemoteStore};
use crate::state::FolderState;
use crate::stats::Stats;
use crate::sync::{sync_folder, SyncOptions};
use crate::tree::layout::{
    folder_dir, format_timestamp, read_cursor, write_cursor, write_file, write_timestamp,
    ACL_FILE, DELEGATES_FILE, FOLDER_FILE, PATH_FILE, RULES_FILE, STORE_FILE, USER_FILE,
};
use crate::tree::{folder_selected, DirectoryIndex, TreeLock};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Back up `store` into the tree at `target`
pub fn backup_store<S: RemoteStore>(
    store: &S,
    target: &Path,
    options: &BackupOptions,
    now: DateTime<Utc>,
) -> Result<Stats> {
    options.validate()?;
    let start = Instant::now();
    let chain = Chain::for_base(target)?;

    let _base_lock = TreeLock::acquire(target)?;
    let _chain_lock = if options.differential {
        Some(TreeLock::acquire(chain.root())?)
    } else {
        None
    };
    let plan = chain.plan(options.differential)?;
    fs::create_dir_all(&plan.write_root)?;

    info!(
        store = store.name(),
        target = %plan.write_root.display(),
        differential = plan.is_differential(),
        "Starting store backup"
    );

    let scoped = options.is_folder_scoped();
    if !scoped {
        write_store_metadata(store, &plan.write_root)?;
    }

    let read_indexes = plan
        .read_roots
        .iter()
        .map(|root| DirectoryIndex::build(root))
        .collect::<Result<Vec<_>>>()?;

    let sync_options = SyncOptions {
        window: options.window,
        flush_threshold: options.flush_threshold,
        with_attachments: options.with_attachments,
    };

    let mut stats = Stats::default();
    let mut seen = HashSet::new();
    for folder in store.folders(true)? {
        let outcome = if folder_selected(folder.path(), &options.folders, options.recursive) {
            seen.insert(folder.sourcekey().to_string());
            backup_folder(&folder, &plan, &read_indexes, &sync_options, now, &mut stats)
        } else {
            FolderOutcome::Skipped {
                path: folder.path().to_string(),
                reason: "outside folder selection".into(),
            }
        };
        match outcome {
            FolderOutcome::Synced {
                path,
                changes,
                deletes,
            } => debug!(folder = %path, changes, deletes, "Folder backed up"),
            FolderOutcome::Skipped { path, reason } => {
                debug!(folder = %path, %reason, "Folder skipped")
            }
            FolderOutcome::Failed { path, error } => {
                stats.errors += 1;
                warn!(folder = %path, error = %error, "Folder backup abandoned");
            }
        }
    }

    if !plan.is_differential() && !scoped {
        stats.deletes += tombstone_removed(&read_indexes[0], &seen, now)?;
    }

    // Scoped base runs leave the run timestamp alone: the chain links to it
    if plan.is_differential() || !scoped {
        write_timestamp(&plan.write_root, now)?;
    }
    if let Some(planned) = plan.generation {
        let removed = if scoped {
            Vec::new()
        } else {
            removed_since(&read_indexes, &seen)?
        };
        stats.deletes += removed.len() as u64;
        chain.write_info(&planned.into_info(format_timestamp(now), scoped, removed))?;
    }

    info!(
        store = store.name(),
        changes = stats.changes,
        deletes = stats.deletes,
        errors = stats.errors,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Store backup complete"
    );
    Ok(stats)
}

fn write_store_metadata<S: RemoteStore>(store: &S, root: &Path) -> Result<()> {
    write_file(&root.join(STORE_FILE), &store.settings_dump()?)?;
    write_file(&root.join(USER_FILE), &store.user_dump()?)?;
    write_file(&root.join(DELEGATES_FILE), &store.delegates_dump()?)?;
    write_file(&root.join(ACL_FILE), &store.permissions_dump()?)?;
    Ok(())
}

fn backup_folder<F: RemoteFolder>(
    folder: &F,
    plan: &BackupPlan,
    read_indexes: &[DirectoryIndex],
    options: &SyncOptions,
    now: DateTime<Utc>,
    stats: &mut Stats,
) -> FolderOutcome {
    let path = folder.path().to_string();
    let mut folder_stats = Stats::default();

    match sync_node(folder, plan, read_indexes, options, now, &mut folder_stats) {
        Ok(()) => {
            *stats += folder_stats;
            FolderOutcome::Synced {
                path,
                changes: folder_stats.changes,
                deletes: folder_stats.deletes,
            }
        }
        Err(error) => {
            // Item errors seen before the failure still count
            stats.errors += folder_stats.errors;
            FolderOutcome::Failed { path, error }
        }
    }
}

/// Capture one folder node: metadata, items, cursor, then the `path` marker
fn sync_node<F: RemoteFolder>(
    folder: &F,
    plan: &BackupPlan,
    read_indexes: &[DirectoryIndex],
    options: &SyncOptions,
    now: DateTime<Utc>,
    stats: &mut Stats,
) -> Result<()> {
    let sourcekey = folder.sourcekey();

    // Newest tree holding the folder supplies the cursor
    let previous: Option<PathBuf> = read_indexes
        .iter()
        .find_map(|index| index.dir(sourcekey))
        .map(Path::to_path_buf);
    let cursor = match &previous {
        Some(dir) => read_cursor(dir)?,
        None => None,
    };

    let node = match (&previous, plan.is_differential()) {
        (Some(dir), false) => dir.clone(),
        _ => folder_dir(&plan.write_root, sourcekey),
    };
    fs::create_dir_all(&node)?;

    write_file(&node.join(FOLDER_FILE), &folder.properties_dump()?)?;
    write_file(&node.join(ACL_FILE), &folder.permissions_dump()?)?;
    match folder.rules_dump()? {
        Some(rules) => write_file(&node.join(RULES_FILE), &rules)?,
        None => {
            if node.join(RULES_FILE).exists() {
                fs::remove_file(node.join(RULES_FILE))?;
            }
        }
    }

    let new_cursor = {
        let mut state = FolderState::open(&node);
        sync_folder(folder, &mut state, cursor.as_ref(), options, now, stats)?
    };

    if plan.is_differential() || cursor.as_ref() != Some(&new_cursor) {
        write_cursor(&node, &new_cursor)?;
    }
    write_file(&node.join(PATH_FILE), folder.path().as_bytes())?;
    Ok(())
}

/// Tombstone base folders no longer present remotely; returns how many
fn tombstone_removed(
    base: &DirectoryIndex,
    seen: &HashSet<String>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut removed = 0;
    for entry in base.entries() {
        if seen.contains(&entry.sourcekey) {
            continue;
        }
        let mut state = FolderState::open(&entry.dir);
        if state.set_folder_tombstone(now)? {
            info!(folder = %entry.path, "Folder removed remotely, tombstoned");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Folders known to the read trees but gone remotely, for a generation
///
/// The newest node of each folder decides; one already tombstoned is not
/// reported again. Folders whose feed failed this run were still listed
/// remotely and are never reported.
fn removed_since(read_indexes: &[DirectoryIndex], seen: &HashSet<String>) -> Result<Vec<String>> {
    let mut checked = HashSet::new();
    let mut removed = BTreeSet::new();
    for index in read_indexes {
        for entry in index.entries() {
            if seen.contains(&entry.sourcekey) || !checked.insert(entry.sourcekey.as_str()) {
                continue;
            }
            let mut state = FolderState::open_read_only(&entry.dir);
            if state.folder_tombstone()?.is_none() {
                info!(folder = %entry.path, "Folder removed remotely");
                removed.insert(entry.sourcekey.clone());
            }
        }
    }
    Ok(removed.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryServer;
    use crate::tree::layout::{read_timestamp_text, STATE_FILE, TIMESTAMP_FILE};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_base_backup_layout() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "hello", b"hi", t(1)).unwrap();
        store
            .set_store_blobs(b"quota=1G", b"alice", b"bob", b"owner")
            .unwrap();

        let stats = backup_store(&store, &target, &BackupOptions::default(), t(2)).unwrap();
        assert_eq!(stats.changes, 1);
        assert_eq!(stats.errors, 0);

        let index = DirectoryIndex::build(&target).unwrap();
        let inbox = index.resolve("Inbox").unwrap();
        assert!(inbox.dir.join(STATE_FILE).exists());
        assert!(inbox.dir.join(FOLDER_FILE).exists());
        assert_eq!(fs::read(target.join(STORE_FILE)).unwrap(), b"quota=1G");
        assert_eq!(fs::read(target.join(DELEGATES_FILE)).unwrap(), b"bob");
        assert!(target.join(TIMESTAMP_FILE).exists());
    }

    #[test]
    fn test_removed_folder_tombstoned_once() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();
        store.add_item("Old", "b", b"b", t(1)).unwrap();
        let old_key = store.folder_sourcekey("Old").unwrap();

        backup_store(&store, &target, &BackupOptions::default(), t(2)).unwrap();
        store.remove_folder("Old").unwrap();

        let stats = backup_store(&store, &target, &BackupOptions::default(), t(3)).unwrap();
        assert_eq!(stats.deletes, 1);
        let stats = backup_store(&store, &target, &BackupOptions::default(), t(4)).unwrap();
        assert_eq!(stats.deletes, 0);

        let index = DirectoryIndex::build(&target).unwrap();
        let mut state = FolderState::open_read_only(index.dir(&old_key).unwrap());
        assert_eq!(state.folder_tombstone().unwrap(), Some(t(3)));
    }

    #[test]
    fn test_scoped_run_does_not_tombstone() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();
        store.add_item("Sent", "b", b"b", t(1)).unwrap();

        backup_store(&store, &target, &BackupOptions::default(), t(2)).unwrap();
        let timestamp = read_timestamp_text(&target).unwrap();

        let scoped = BackupOptions {
            folders: vec!["Inbox".into()],
            ..Default::default()
        };
        let stats = backup_store(&store, &target, &scoped, t(3)).unwrap();
        assert_eq!(stats.deletes, 0);
        assert_eq!(read_timestamp_text(&target).unwrap(), timestamp);
    }

    #[test]
    fn test_feed_failure_abandons_folder_only() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");
        store.add_item("Inbox", "a", b"a", t(1)).unwrap();
        store.add_item("Sent", "b", b"b", t(1)).unwrap();
        store.set_feed_down("Inbox", true).unwrap();

        let stats = backup_store(&store, &target, &BackupOptions::default(), t(2)).unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.changes, 1);

        // Inbox node never completed, so the next run starts it from scratch
        let index = DirectoryIndex::build(&target).unwrap();
        assert!(index.resolve("Inbox").is_none());
        assert!(index.resolve("Sent").is_some());

        store.set_feed_down("Inbox", false).unwrap();
        let stats = backup_store(&store, &target, &BackupOptions::default(), t(3)).unwrap();
        assert_eq!(stats.changes, 1);
        assert!(DirectoryIndex::build(&target).unwrap().resolve("Inbox").is_some());
    }

    #[test]
    fn test_locked_tree_rejected() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("alice");
        let server = MemoryServer::new();
        let store = server.add_store("alice");

        let _held = TreeLock::acquire(&target).unwrap();
        let result = backup_store(&store, &target, &BackupOptions::default(), t(2));
        assert!(matches!(result, Err(crate::error::BackupError::Locked { .. })));
    }
}
