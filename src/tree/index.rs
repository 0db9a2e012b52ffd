//! Directory index of a backup tree
//!
//! Maps folder sourcekeys and logical paths to node directories. Built by
//! walking every `folders/` directory depth-first; nodes without a `path`
//! file were never completed and are ignored along with their subtree.
//!
//! A deleted folder and its replacement may share a logical path; path
//! lookups then resolve to the live one.

use crate::error::Result;
use crate::state::FolderState;
use crate::tree::layout::{read_text, FOLDERS_DIR, PATH_FILE};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One folder node in a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub sourcekey: String,
    /// Logical folder path
    pub path: String,
    /// Node directory (absolute)
    pub dir: PathBuf,
}

/// Sourcekey and path lookup over a tree's folder nodes
#[derive(Debug, Clone, Default)]
pub struct DirectoryIndex {
    root: PathBuf,
    by_sourcekey: BTreeMap<String, FolderEntry>,
    by_path: BTreeMap<String, String>,
}

impl DirectoryIndex {
    /// Index the tree at `root`; a missing root yields an empty index
    pub fn build(root: &Path) -> Result<Self> {
        let mut index = Self {
            root: root.to_path_buf(),
            ..Default::default()
        };
        index.walk(root)?;
        Ok(index)
    }

    fn walk(&mut self, node: &Path) -> Result<()> {
        let folders = node.join(FOLDERS_DIR);
        if !folders.is_dir() {
            return Ok(());
        }

        let mut children: Vec<_> = fs::read_dir(&folders)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .collect();
        children.sort_by_key(|entry| entry.file_name());

        for child in children {
            let dir = child.path();
            let Some(path) = read_text(&dir.join(PATH_FILE))? else {
                continue;
            };
            let sourcekey = child.file_name().to_string_lossy().into_owned();

            let claims_path = match self.by_path.get(&path) {
                Some(current) => self.supersedes(current, &dir)?,
                None => true,
            };
            if claims_path {
                self.by_path.insert(path.clone(), sourcekey.clone());
            }
            self.by_sourcekey.insert(
                sourcekey.clone(),
                FolderEntry {
                    sourcekey,
                    path,
                    dir: dir.clone(),
                },
            );
            self.walk(&dir)?;
        }
        Ok(())
    }

    /// Whether the node at `candidate` should take a path held by `current`
    fn supersedes(&self, current: &str, candidate: &Path) -> Result<bool> {
        let current_deleted = match self.by_sourcekey.get(current) {
            Some(entry) => is_deleted(&entry.dir)?,
            None => true,
        };
        Ok(current_deleted && !is_deleted(candidate)?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, sourcekey: &str) -> Option<&FolderEntry> {
        self.by_sourcekey.get(sourcekey)
    }

    /// Node directory of a folder
    pub fn dir(&self, sourcekey: &str) -> Option<&Path> {
        self.get(sourcekey).map(|entry| entry.dir.as_path())
    }

    /// Node directory relative to the tree root
    pub fn relative(&self, sourcekey: &str) -> Option<&Path> {
        self.dir(sourcekey)
            .and_then(|dir| dir.strip_prefix(&self.root).ok())
    }

    /// Look a folder up by logical path
    ///
    /// When several nodes share the path, a live folder wins over deleted
    /// ones; otherwise the first node indexed is kept.
    pub fn resolve(&self, path: &str) -> Option<&FolderEntry> {
        self.by_path.get(path).and_then(|sk| self.by_sourcekey.get(sk))
    }

    pub fn contains(&self, sourcekey: &str) -> bool {
        self.by_sourcekey.contains_key(sourcekey)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(String::as_str)
    }

    /// Entries ordered by logical path (parents before children)
    pub fn entries(&self) -> Vec<&FolderEntry> {
        // A deleted folder and its replacement may share a path
        let mut entries: Vec<_> = self.by_sourcekey.values().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.sourcekey.cmp(&b.sourcekey)));
        entries
    }

    /// Entries matching a folder filter, ordered by path
    pub fn select(&self, folders: &[String], recursive: bool) -> Vec<&FolderEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| folder_selected(&entry.path, folders, recursive))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_sourcekey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sourcekey.is_empty()
    }
}

fn is_deleted(dir: &Path) -> Result<bool> {
    Ok(FolderState::open_read_only(dir).folder_tombstone()?.is_some())
}

/// Check a logical path against a folder filter
///
/// An empty filter selects everything. With `recursive`, subfolders of a
/// listed path are selected too.
pub fn folder_selected(path: &str, folders: &[String], recursive: bool) -> bool {
    if folders.is_empty() {
        return true;
    }
    folders.iter().any(|wanted| {
        let wanted = wanted.trim_matches('/');
        path == wanted
            || (recursive
                && path.len() > wanted.len()
                && path.starts_with(wanted)
                && path.as_bytes()[wanted.len()] == b'/')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::layout::folder_dir;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn node(parent: &Path, sourcekey: &str, path: Option<&str>) -> PathBuf {
        let dir = folder_dir(parent, sourcekey);
        fs::create_dir_all(&dir).unwrap();
        if let Some(path) = path {
            fs::write(dir.join(PATH_FILE), path).unwrap();
        }
        dir
    }

    #[test]
    fn test_build_index() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        node(root, "AA", Some("Inbox"));
        let sent = node(root, "BB", Some("Sent"));
        // Nested layout
        node(&sent, "CC", Some("Sent/2023"));
        // Incomplete node and its subtree are ignored
        let broken = node(root, "DD", None);
        node(&broken, "EE", Some("Broken/Child"));

        let index = DirectoryIndex::build(root).unwrap();
        assert_eq!(index.len(), 3);
        assert!(!index.contains("DD"));
        assert!(!index.contains("EE"));
        assert_eq!(index.resolve("Sent/2023").unwrap().sourcekey, "CC");
        assert_eq!(
            index.relative("CC").unwrap(),
            Path::new("folders/BB/folders/CC")
        );
        let paths: Vec<_> = index.paths().collect();
        assert_eq!(paths, vec!["Inbox", "Sent", "Sent/2023"]);
    }

    #[test]
    fn test_shared_path_resolves_to_live_folder() {
        let deleted_at = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        for (old, new) in [("AA", "BB"), ("BB", "AA")] {
            let dir = tempdir().unwrap();
            let replaced = node(dir.path(), old, Some("Projects"));
            node(dir.path(), new, Some("Projects"));
            FolderState::open(&replaced)
                .set_folder_tombstone(deleted_at)
                .unwrap();

            let index = DirectoryIndex::build(dir.path()).unwrap();
            assert_eq!(index.len(), 2);
            assert_eq!(index.resolve("Projects").unwrap().sourcekey, new);
        }
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let index = DirectoryIndex::build(&dir.path().join("nothing")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_folder_selected() {
        let filter = vec!["Inbox".to_string()];
        assert!(folder_selected("Inbox", &filter, false));
        assert!(!folder_selected("Inbox/Work", &filter, false));
        assert!(folder_selected("Inbox/Work", &filter, true));
        assert!(!folder_selected("Inboxes", &filter, true));
        assert!(folder_selected("Anything", &[], false));
    }

    #[test]
    fn test_select() {
        let dir = tempdir().unwrap();
        node(dir.path(), "AA", Some("Inbox"));
        node(dir.path(), "AB", Some("Inbox/Work"));
        node(dir.path(), "BB", Some("Sent"));

        let index = DirectoryIndex::build(dir.path()).unwrap();
        let selected: Vec<_> = index
            .select(&["Inbox".to_string()], true)
            .iter()
            .map(|e| e.sourcekey.as_str())
            .collect();
        assert_eq!(selected, vec!["AA", "AB"]);
    }
}
