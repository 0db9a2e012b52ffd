//! Operation counters and tree statistics

use crate::error::Result;
use crate::state::FolderState;
use crate::tree::layout::FOLDERS_DIR;
use crate::tree::DirectoryIndex;
use std::io;
use std::ops::{Add, AddAssign};
use std::path::Path;
use walkdir::WalkDir;

/// Counters reported by backup and restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Items created or changed (backup: upserts and read changes)
    pub changes: u64,
    /// Deletions recorded (backup) or applied (restore)
    pub deletes: u64,
    /// Records deliberately left alone (restore filters and duplicates)
    pub skipped: u64,
    /// Item or folder failures that were logged and skipped
    pub errors: u64,
}

impl Stats {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.changes += other.changes;
        self.deletes += other.deletes;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

impl Add for Stats {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

/// Counters reported by purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub folders_removed: u64,
    pub items_removed: u64,
}

/// Summary of one folder node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSummary {
    pub path: String,
    pub sourcekey: String,
    /// Stored item payloads
    pub items: u64,
    /// Index records, tombstones included
    pub records: u64,
    pub tombstones: u64,
    pub folder_deleted: bool,
    /// On-disk size of the node (stores and flat files, not subfolders)
    pub disk_bytes: u64,
}

/// Summarize every folder node of a tree, ordered by path
pub fn tree_stats(root: &Path) -> Result<Vec<FolderSummary>> {
    let index = DirectoryIndex::build(root)?;
    let mut summaries = Vec::with_capacity(index.len());

    for entry in index.entries() {
        let mut state = FolderState::open_read_only(&entry.dir);
        let records = state.records()?;
        summaries.push(FolderSummary {
            path: entry.path.clone(),
            sourcekey: entry.sourcekey.clone(),
            items: state.item_count()?,
            records: records.len() as u64,
            tombstones: records.iter().filter(|(_, r)| r.is_deleted()).count() as u64,
            folder_deleted: state.folder_tombstone()?.is_some(),
            disk_bytes: node_size(&entry.dir)?,
        });
    }
    Ok(summaries)
}

fn node_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    // Subfolder nodes are summarized on their own
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != FOLDERS_DIR);
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}
