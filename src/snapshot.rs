//! Applying a daily diff to the history snapshot.
//!
//! The base file is never written in place. osmium writes the updated
//! history to a temporary file next to the base (same filesystem), which is
//! then renamed over the base. If anything fails before the rename the base
//! file is byte-for-byte what it was.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::models::DailyChangeset;
use crate::osmium::ExtractionTool;

pub struct SnapshotUpdater<'a> {
    tool: &'a dyn ExtractionTool,
    /// Tag filters re-applied to the updated history before the swap.
    prefilter: Vec<String>,
}

impl<'a> SnapshotUpdater<'a> {
    pub fn new(tool: &'a dyn ExtractionTool) -> Self {
        Self {
            tool,
            prefilter: Vec::new(),
        }
    }

    /// Restrict the history to objects matching any of `expressions` after
    /// each diff. An empty list disables the filter.
    pub fn with_prefilter(mut self, expressions: Vec<String>) -> Self {
        self.prefilter = expressions;
        self
    }

    /// Apply `diff` to `base`, atomically replacing it. The diff file is
    /// removed once the new snapshot is in place.
    pub async fn apply(&self, base: &Path, diff: &DailyChangeset, run_id: &str) -> Result<PathBuf> {
        let applied = temp_sibling(base, run_id, "applied");
        let filtered = temp_sibling(base, run_id, "filtered");

        let staged = match self.stage(base, diff, &applied, &filtered).await {
            Ok(path) => path,
            Err(err) => {
                remove_if_exists(&applied).await;
                remove_if_exists(&filtered).await;
                return Err(err);
            }
        };

        if let Err(err) = tokio::fs::rename(&staged, base).await {
            remove_if_exists(&applied).await;
            remove_if_exists(&filtered).await;
            return Err(err).with_context(|| {
                format!("Failed to replace {} with {}", base.display(), staged.display())
            });
        }

        remove_if_exists(&applied).await;
        remove_if_exists(&filtered).await;
        // The base is already replaced; a leftover diff is cleaned up with
        // the run directory.
        if let Err(err) = tokio::fs::remove_file(&diff.local_path).await {
            tracing::warn!(
                path = %diff.local_path.display(),
                error = %err,
                "failed to remove applied diff"
            );
        }

        tracing::info!(
            day = %diff.day,
            sequence = %diff.sequence,
            history = %base.display(),
            "history file updated"
        );
        Ok(base.to_path_buf())
    }

    async fn stage(
        &self,
        base: &Path,
        diff: &DailyChangeset,
        applied: &Path,
        filtered: &Path,
    ) -> Result<PathBuf> {
        let started = std::time::Instant::now();
        self.tool
            .apply_changes(base, &diff.local_path, applied)
            .await?;
        tracing::info!(
            sequence = %diff.sequence,
            duration_ms = started.elapsed().as_millis() as u64,
            "changes applied"
        );

        if self.prefilter.is_empty() {
            return Ok(applied.to_path_buf());
        }

        let started = std::time::Instant::now();
        self.tool
            .tags_filter(applied, &self.prefilter, filtered)
            .await?;
        tracing::info!(
            filters = self.prefilter.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "history re-filtered by dataset tags"
        );
        Ok(filtered.to_path_buf())
    }
}

/// `dir/presets-history.osh.pbf` → `dir/.presets-history.<run>.<tag>.osh.pbf`.
///
/// The format suffix is kept so osmium picks the right output format.
fn temp_sibling(base: &Path, run_id: &str, tag: &str) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "history.osh.pbf".to_string());
    let (stem, suffix) = match name.find('.') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => (name.as_str(), "osh.pbf"),
    };
    base.with_file_name(format!(".{}.{}.{}.{}", stem, run_id, tag, suffix))
}

async fn remove_if_exists(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove temporary file");
        }
    }
}
