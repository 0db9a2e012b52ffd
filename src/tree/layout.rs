//! On-disk layout of a backup tree
//!
//! ```text
//! <base>/
//!   lock                 advisory lock file
//!   store user delegates acl
//!   timestamp            RFC 3339 time of the last full run
//!   merged               last generation merged into this base
//!   folders/<sourcekey>/
//!     path               logical folder path (written last)
//!     folder acl rules   opaque metadata dumps
//!     state              change-feed cursor
//!     items/ index/      RocksDB stores
//!     folders/...        nested nodes from older layouts
//! ```
//!
//! Differential generations live beside the base at
//! `<parent>/differential/<base name>/<N>/` with the same node layout plus
//! a `generation` metadata file.

use crate::remote::Cursor;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const LOCK_FILE: &str = "lock";
pub const STORE_FILE: &str = "store";
pub const USER_FILE: &str = "user";
pub const DELEGATES_FILE: &str = "delegates";
pub const ACL_FILE: &str = "acl";
pub const TIMESTAMP_FILE: &str = "timestamp";
pub const MERGED_FILE: &str = "merged";
pub const GENERATION_FILE: &str = "generation";

pub const FOLDERS_DIR: &str = "folders";
pub const PATH_FILE: &str = "path";
pub const FOLDER_FILE: &str = "folder";
pub const RULES_FILE: &str = "rules";
pub const STATE_FILE: &str = "state";
pub const ITEMS_DB: &str = "items";
pub const INDEX_DB: &str = "index";

pub const DIFFERENTIAL_DIR: &str = "differential";

/// Store-level metadata files copied verbatim between trees
pub const STORE_METADATA_FILES: [&str; 4] = [STORE_FILE, USER_FILE, DELEGATES_FILE, ACL_FILE];

/// Per-folder flat files, in the order they are copied
pub const FOLDER_METADATA_FILES: [&str; 5] =
    [FOLDER_FILE, ACL_FILE, RULES_FILE, STATE_FILE, PATH_FILE];

/// Directory of a folder node directly under `node`
pub fn folder_dir(node: &Path, sourcekey: &str) -> PathBuf {
    node.join(FOLDERS_DIR).join(sourcekey)
}

/// Write a file via a temporary sibling and rename
pub fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a file that may not exist
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read an optional text file, trimmed
pub fn read_text(path: &Path) -> io::Result<Option<String>> {
    Ok(read_optional(path)?.map(|data| String::from_utf8_lossy(&data).trim().to_string()))
}

/// Canonical text form of a run timestamp
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Raw `timestamp` file text of a tree node
pub fn read_timestamp_text(node: &Path) -> io::Result<Option<String>> {
    read_text(&node.join(TIMESTAMP_FILE))
}

pub fn write_timestamp(node: &Path, time: DateTime<Utc>) -> io::Result<()> {
    write_file(&node.join(TIMESTAMP_FILE), format_timestamp(time).as_bytes())
}

/// Persisted change-feed cursor of a folder node
pub fn read_cursor(folder: &Path) -> io::Result<Option<Cursor>> {
    Ok(read_text(&folder.join(STATE_FILE))?
        .filter(|text| !text.is_empty())
        .map(|text| Cursor::decode(&text)))
}

pub fn write_cursor(folder: &Path, cursor: &Cursor) -> io::Result<()> {
    write_file(&folder.join(STATE_FILE), cursor.encode().as_bytes())
}

/// Recursively copy a directory, overwriting existing files
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
