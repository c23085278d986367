//! Per-run scratch directories and small filesystem helpers.
//!
//! Each run gets its own tree under `<work_dir>/runs/<run_id>/` so two runs
//! never share intermediate files:
//!
//! ```text
//! runs/<run_id>/
//! ├── history/        downloaded .osc.gz diffs
//! ├── current-day/    time-filtered country snapshot
//! ├── level-1/        one file per state
//! ├── level-2/        one file per microregion
//! ├── level-3/        one file per municipality
//! └── datasets/       per (municipality, dataset) scratch files
//! ```
//!
//! A failed run leaves its directory behind for inspection; nothing in it
//! is trusted by later runs.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::RegionLevel;

#[derive(Debug, Clone)]
pub struct RunDirs {
    run_id: String,
    root: PathBuf,
}

impl RunDirs {
    /// Create the run tree for a fresh random run ID.
    pub async fn create(work_dir: &Path) -> Result<Self> {
        Self::create_with_id(work_dir, &Uuid::new_v4().to_string()).await
    }

    pub async fn create_with_id(work_dir: &Path, run_id: &str) -> Result<Self> {
        let root = work_dir.join("runs").join(run_id);
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create run directory: {}", root.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            root,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn current_day_file(&self) -> PathBuf {
        self.root.join("current-day").join("current-day.osm.pbf")
    }

    pub fn level_dir(&self, level: RegionLevel) -> PathBuf {
        self.root.join(format!("level-{}", level.number()))
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.root.join("datasets")
    }

    /// Remove the whole run tree. Called after a successful run.
    pub async fn cleanup(self) -> Result<()> {
        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.root)
                .await
                .with_context(|| format!("Failed to remove {}", self.root.display()))?;
        }
        Ok(())
    }
}

/// Delete `dir` if present and recreate it empty.
pub async fn reset_dir(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}

/// Write `contents` to `path` through a sibling temp file and a rename, so a
/// crash never leaves a half-written file behind.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = sibling_temp_path(path);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// `dir/name` → `dir/.name.<uuid>.tmp`, on the same filesystem as `path`.
fn sibling_temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_dirs_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let a = RunDirs::create(tmp.path()).await.unwrap();
        let b = RunDirs::create(tmp.path()).await.unwrap();
        assert_ne!(a.root(), b.root());
        assert!(a.level_dir(RegionLevel::Microregion).ends_with("level-2"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta.json");
        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        write_atomic(&path, b"{\"a\":2}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let entries: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_dir_empties() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("level-2");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old.osm.pbf"), b"x").unwrap();
        reset_dir(&dir).await.unwrap();
        assert!(dir.exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}
