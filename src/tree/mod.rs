//! Backup tree filesystem layout
//!
//! - `layout`: File names, atomic writes, timestamps and cursors
//! - `lock`: Exclusive advisory lock per tree
//! - `index`: Sourcekey/path index over a tree's folder nodes

pub mod index;
pub mod layout;
pub mod lock;

pub use index::{folder_selected, DirectoryIndex, FolderEntry};
pub use lock::TreeLock;
