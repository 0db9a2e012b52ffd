//! Differential chain management
//!
//! A base tree at `<parent>/<name>` owns a chain of numbered generations
//! under `<parent>/differential/<name>/1, 2, ...`. Each generation records,
//! in its `generation` file, which generation it was built from and the
//! `timestamp` of that predecessor, so a merge can verify the chain before
//! touching the base.
//!
//! Generation numbering is a plain counter: the caller must hold the chain
//! root's [`TreeLock`](crate::tree::TreeLock) while planning and writing.

use crate::error::{BackupError, ChainError, Result};
use crate::tree::layout::{
    read_text, read_timestamp_text, write_file, DIFFERENTIAL_DIR, FOLDERS_DIR, GENERATION_FILE,
    MERGED_FILE,
};
use crate::tree::DirectoryIndex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Generation number of the base tree itself
pub const BASE_GENERATION: u32 = 0;

/// Persisted metadata of one generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub generation: u32,
    /// Generation this one was read from (0 = base)
    pub from_generation: u32,
    /// `timestamp` text of the node it was read from
    pub from_timestamp: Option<String>,
    /// Run timestamp (RFC 3339)
    pub timestamp: String,
    /// Only part of the hierarchy was captured
    pub folder_scoped: bool,
    /// Sourcekeys of folders found removed remotely during the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// Generation a differential run is about to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedGeneration {
    pub generation: u32,
    pub from_generation: u32,
    pub from_timestamp: Option<String>,
}

impl PlannedGeneration {
    pub fn into_info(
        self,
        timestamp: String,
        folder_scoped: bool,
        removed: Vec<String>,
    ) -> GenerationInfo {
        GenerationInfo {
            generation: self.generation,
            from_generation: self.from_generation,
            from_timestamp: self.from_timestamp,
            timestamp,
            folder_scoped,
            removed,
        }
    }
}

/// Where a backup run reads from and writes to
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub write_root: PathBuf,
    /// Trees consulted for existing folders and cursors, newest first
    pub read_roots: Vec<PathBuf>,
    pub generation: Option<PlannedGeneration>,
}

impl BackupPlan {
    pub fn is_differential(&self) -> bool {
        self.generation.is_some()
    }
}

/// Listing entry for one generation
#[derive(Debug, Clone)]
pub struct GenerationStatus {
    pub info: GenerationInfo,
    pub merged: bool,
    pub folders: usize,
}

/// A base tree and its differential chain
#[derive(Debug, Clone)]
pub struct Chain {
    base: PathBuf,
    root: PathBuf,
}

impl Chain {
    /// Locate the chain belonging to a base tree
    pub fn for_base(base: &Path) -> Result<Self> {
        let invalid = |reason: &str| BackupError::InvalidTree {
            path: base.to_path_buf(),
            reason: reason.to_string(),
        };
        let name = base.file_name().ok_or_else(|| invalid("path has no final component"))?;
        let parent = base.parent().ok_or_else(|| invalid("path has no parent directory"))?;

        Ok(Self {
            base: base.to_path_buf(),
            root: parent.join(DIFFERENTIAL_DIR).join(name),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding the generations
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, generation: u32) -> PathBuf {
        if generation == BASE_GENERATION {
            self.base.clone()
        } else {
            self.root.join(generation.to_string())
        }
    }

    /// Existing generation numbers, ascending
    pub fn generations(&self) -> Result<Vec<u32>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut generations: Vec<u32> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .filter(|&n| n != BASE_GENERATION)
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }

    fn has_info(&self, generation: u32) -> bool {
        self.generation_dir(generation).join(GENERATION_FILE).is_file()
    }

    pub fn read_info(&self, generation: u32) -> Result<GenerationInfo> {
        let dir = self.generation_dir(generation);
        if !dir.is_dir() {
            return Err(ChainError::NoSuchGeneration { generation }.into());
        }
        let text = read_text(&dir.join(GENERATION_FILE))?
            .ok_or(ChainError::MissingMetadata { generation })?;
        let info: GenerationInfo =
            serde_json::from_str(&text).map_err(|e| ChainError::InvalidMetadata {
                generation,
                reason: e.to_string(),
            })?;
        if info.generation != generation {
            return Err(ChainError::InvalidMetadata {
                generation,
                reason: format!("metadata names generation {}", info.generation),
            }
            .into());
        }
        Ok(info)
    }

    pub fn write_info(&self, info: &GenerationInfo) -> Result<()> {
        let dir = self.generation_dir(info.generation);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(info).map_err(|e| ChainError::InvalidMetadata {
            generation: info.generation,
            reason: e.to_string(),
        })?;
        write_file(&dir.join(GENERATION_FILE), json.as_bytes())?;
        Ok(())
    }

    /// Last generation merged into the base (0 if none)
    pub fn merged(&self) -> Result<u32> {
        match read_text(&self.base.join(MERGED_FILE))? {
            Some(text) => text.parse().map_err(|_| {
                BackupError::InvalidTree {
                    path: self.base.clone(),
                    reason: format!("unreadable merged marker '{}'", text),
                }
            }),
            None => Ok(BASE_GENERATION),
        }
    }

    pub fn set_merged(&self, generation: u32) -> Result<()> {
        write_file(
            &self.base.join(MERGED_FILE),
            generation.to_string().as_bytes(),
        )?;
        Ok(())
    }

    /// Generations not yet merged into the base, ascending
    pub fn pending(&self) -> Result<Vec<u32>> {
        let merged = self.merged()?;
        Ok(self
            .generations()?
            .into_iter()
            .filter(|&n| n > merged)
            .collect())
    }

    /// Decide where the next run reads from and writes to
    ///
    /// A differential run builds on the newest unmerged generation, or on
    /// the base once everything is merged. Call it under the chain lock:
    /// incomplete trailing generations are deleted here.
    pub fn plan(&self, differential: bool) -> Result<BackupPlan> {
        if !differential {
            return Ok(BackupPlan {
                write_root: self.base.clone(),
                read_roots: vec![self.base.clone()],
                generation: None,
            });
        }

        if !self.base.join(FOLDERS_DIR).is_dir() {
            return Err(BackupError::InvalidTree {
                path: self.base.clone(),
                reason: "differential backup requires an existing base backup".into(),
            });
        }

        let merged = self.merged()?;
        let mut existing = self.generations()?;

        // A run killed before writing its metadata leaves a trailing
        // generation without it; its number is reused
        while let Some(&last) = existing.last() {
            if last <= merged || self.has_info(last) {
                break;
            }
            warn!(
                base = %self.base.display(),
                generation = last,
                "Discarding incomplete generation"
            );
            fs::remove_dir_all(self.generation_dir(last))?;
            existing.pop();
        }

        let unmerged: Vec<u32> = existing.iter().copied().filter(|&n| n > merged).collect();
        if let Some(&generation) = unmerged.iter().find(|&&n| !self.has_info(n)) {
            return Err(ChainError::MissingMetadata { generation }.into());
        }

        // Merged generations live on in the base
        let (from, from_timestamp) = match unmerged.last() {
            Some(&latest) => (latest, Some(self.read_info(latest)?.timestamp)),
            None => (merged, read_timestamp_text(&self.base)?),
        };
        let generation = existing.last().copied().unwrap_or(BASE_GENERATION).max(merged) + 1;

        let mut read_roots: Vec<PathBuf> = unmerged
            .iter()
            .rev()
            .map(|&n| self.generation_dir(n))
            .collect();
        read_roots.push(self.base.clone());

        debug!(
            base = %self.base.display(),
            generation,
            from_generation = from,
            "Planned differential generation"
        );

        Ok(BackupPlan {
            write_root: self.generation_dir(generation),
            read_roots,
            generation: Some(PlannedGeneration {
                generation,
                from_generation: from,
                from_timestamp,
            }),
        })
    }

    /// Check that `generations` can be merged next, in this order
    ///
    /// The list must continue the chain from the last merged generation
    /// without gaps, and each generation must have been built from its
    /// predecessor.
    pub fn verify(&self, generations: &[u32]) -> Result<Vec<GenerationInfo>> {
        let mut previous = self.merged()?;
        let mut previous_timestamp = read_timestamp_text(&self.base)?;
        let mut infos = Vec::with_capacity(generations.len());

        for &generation in generations {
            if generation != previous + 1 {
                return Err(ChainError::OutOfOrder {
                    expected: previous + 1,
                    found: generation,
                }
                .into());
            }

            let info = self.read_info(generation)?;
            if info.from_generation != previous {
                return Err(ChainError::BrokenLink {
                    generation,
                    recorded: format!("generation {}", info.from_generation),
                    actual: format!("generation {}", previous),
                }
                .into());
            }
            if info.from_timestamp != previous_timestamp {
                return Err(ChainError::BrokenLink {
                    generation,
                    recorded: info.from_timestamp.clone().unwrap_or_else(|| "nothing".into()),
                    actual: previous_timestamp.unwrap_or_else(|| "nothing".into()),
                }
                .into());
            }

            previous = generation;
            previous_timestamp = Some(info.timestamp.clone());
            infos.push(info);
        }
        Ok(infos)
    }

    /// Every generation with its merge status
    pub fn list(&self) -> Result<Vec<GenerationStatus>> {
        let merged = self.merged()?;
        self.generations()?
            .into_iter()
            .map(|generation| {
                let info = self.read_info(generation)?;
                let folders = DirectoryIndex::build(&self.generation_dir(generation))?.len();
                Ok(GenerationStatus {
                    info,
                    merged: generation <= merged,
                    folders,
                })
            })
            .collect()
    }
}

/// List the differential generations of a base tree
pub fn list_generations(base: &Path) -> Result<Vec<GenerationStatus>> {
    Chain::for_base(base)?.list()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_generation(chain: &Chain, generation: u32, from_timestamp: Option<&str>, ts: &str) {
        chain
            .write_info(&GenerationInfo {
                generation,
                from_generation: generation - 1,
                from_timestamp: from_timestamp.map(str::to_string),
                timestamp: ts.to_string(),
                folder_scoped: false,
                removed: Vec::new(),
            })
            .unwrap();
    }

    #[test]
    fn test_chain_root_beside_base() {
        let chain = Chain::for_base(Path::new("/srv/backup/alice")).unwrap();
        assert_eq!(chain.root(), Path::new("/srv/backup/differential/alice"));
        assert_eq!(
            chain.generation_dir(3),
            PathBuf::from("/srv/backup/differential/alice/3")
        );
        assert_eq!(chain.generation_dir(0), PathBuf::from("/srv/backup/alice"));
    }

    #[test]
    fn test_plan_allocates_next_generation() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(base.join(FOLDERS_DIR)).unwrap();
        fs::write(base.join("timestamp"), "T0").unwrap();
        let chain = Chain::for_base(&base).unwrap();

        let plan = chain.plan(false).unwrap();
        assert_eq!(plan.write_root, base);
        assert!(!plan.is_differential());

        let plan = chain.plan(true).unwrap();
        let planned = plan.generation.clone().unwrap();
        assert_eq!(planned.generation, 1);
        assert_eq!(planned.from_timestamp.as_deref(), Some("T0"));
        assert_eq!(plan.read_roots, vec![base.clone()]);

        write_generation(&chain, 1, Some("T0"), "T1");
        fs::write(chain.generation_dir(1).join("timestamp"), "T1").unwrap();
        let plan = chain.plan(true).unwrap();
        assert_eq!(plan.generation.unwrap().generation, 2);
        assert_eq!(plan.read_roots, vec![chain.generation_dir(1), base]);
    }

    #[test]
    fn test_plan_discards_incomplete_generation() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(base.join(FOLDERS_DIR)).unwrap();
        fs::write(base.join("timestamp"), "T0").unwrap();
        let chain = Chain::for_base(&base).unwrap();
        write_generation(&chain, 1, Some("T0"), "T1");
        fs::create_dir_all(chain.generation_dir(2).join(FOLDERS_DIR)).unwrap();

        let planned = chain.plan(true).unwrap().generation.unwrap();
        assert_eq!(planned.generation, 2);
        assert_eq!(planned.from_generation, 1);
        assert_eq!(planned.from_timestamp.as_deref(), Some("T1"));
        assert!(!chain.generation_dir(2).exists());

        // Below a complete generation it cannot be repaired
        fs::remove_file(chain.generation_dir(1).join(GENERATION_FILE)).unwrap();
        write_generation(&chain, 2, Some("T1"), "T2");
        assert!(matches!(
            chain.plan(true),
            Err(BackupError::Chain(ChainError::MissingMetadata { generation: 1 }))
        ));
    }

    #[test]
    fn test_plan_after_merge_builds_on_base() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(base.join(FOLDERS_DIR)).unwrap();
        let chain = Chain::for_base(&base).unwrap();
        write_generation(&chain, 1, Some("T0"), "T1");
        chain.set_merged(1).unwrap();
        // Base re-run after the merge
        fs::write(base.join("timestamp"), "T5").unwrap();

        let plan = chain.plan(true).unwrap();
        assert_eq!(plan.read_roots, vec![base.clone()]);
        let planned = plan.generation.unwrap();
        assert_eq!(planned.generation, 2);
        assert_eq!(planned.from_generation, 1);
        assert_eq!(planned.from_timestamp.as_deref(), Some("T5"));

        write_generation(&chain, 2, Some("T5"), "T6");
        assert_eq!(chain.verify(&[2]).unwrap().len(), 1);
    }

    #[test]
    fn test_differential_requires_base() {
        let dir = tempdir().unwrap();
        let chain = Chain::for_base(&dir.path().join("nobody")).unwrap();
        assert!(matches!(
            chain.plan(true),
            Err(BackupError::InvalidTree { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_out_of_order() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("timestamp"), "T0").unwrap();
        let chain = Chain::for_base(&base).unwrap();
        write_generation(&chain, 1, Some("T0"), "T1");
        write_generation(&chain, 2, Some("T1"), "T2");

        assert_eq!(chain.verify(&[1, 2]).unwrap().len(), 2);
        assert!(matches!(
            chain.verify(&[2, 1]),
            Err(BackupError::Chain(ChainError::OutOfOrder {
                expected: 1,
                found: 2
            }))
        ));

        chain.set_merged(1).unwrap();
        assert_eq!(chain.pending().unwrap(), vec![2]);
        assert!(matches!(
            chain.verify(&[1]),
            Err(BackupError::Chain(ChainError::OutOfOrder { .. }))
        ));
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(&base).unwrap();
        // Base re-run after generation 1 was written
        fs::write(base.join("timestamp"), "T9").unwrap();
        let chain = Chain::for_base(&base).unwrap();
        write_generation(&chain, 1, Some("T0"), "T1");

        assert!(matches!(
            chain.verify(&[1]),
            Err(BackupError::Chain(ChainError::BrokenLink { generation: 1, .. }))
        ));
    }

    #[test]
    fn test_missing_metadata() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("alice");
        fs::create_dir_all(&base).unwrap();
        let chain = Chain::for_base(&base).unwrap();
        fs::create_dir_all(chain.generation_dir(1)).unwrap();

        assert!(matches!(
            chain.verify(&[1]),
            Err(BackupError::Chain(ChainError::MissingMetadata { generation: 1 }))
        ));
        assert!(matches!(
            chain.read_info(4),
            Err(BackupError::Chain(ChainError::NoSuchGeneration { generation: 4 }))
        ));
    }
}
