//! Hierarchical region splitting.
//!
//! The country-level daily snapshot is cut in three levels, each a full
//! fan-out with a barrier before the next begins:
//!
//! ```text
//! current-day.osm.pbf
//!   └─ level 1: one `osmium extract` with the multi-state config   → level-1/<state>.osm.pbf
//!        └─ level 2: one extract per level2_dir/<state>.json       → level-2/<microregion>.osm.pbf
//!             └─ level 3: one extract per level3_dir/<micro>.json  → level-3/<municipality>.osm.pbf
//! ```
//!
//! After each level every output with zero features is deleted, so only
//! non-empty regions are used as input for the next level. A level-2/3
//! config whose parent file is absent is skipped without error.
//!
//! Under the best-effort policy a failed unit is not the same as an empty
//! region. Its partial outputs are deleted and every region it would have
//! produced, plus everything below those, is reported in
//! [`SplitOutcome::incomplete`] so dataset extraction leaves their
//! previously published artifacts alone.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::{BoundariesConfig, FailurePolicy};
use crate::fanout::{UnitLabel, WorkerLimiter};
use crate::models::{AdminRegion, RegionLevel};
use crate::osmium::ExtractionTool;
use crate::workdir::{reset_dir, RunDirs};

/// One `osmium extract` invocation.
#[derive(Debug, Clone)]
pub struct SplitUnit {
    pub level: RegionLevel,
    pub parent_id: Option<String>,
    pub config: PathBuf,
    pub input: PathBuf,
}

impl UnitLabel for SplitUnit {
    fn label(&self) -> String {
        match &self.parent_id {
            Some(parent) => format!("{} of {}", self.level.label(), parent),
            None => self.level.label().to_string(),
        }
    }
}

impl UnitLabel for PathBuf {
    fn label(&self) -> String {
        self.display().to_string()
    }
}

/// Result of one level of the split.
#[derive(Debug, Clone)]
pub struct LevelOutcome {
    pub level: RegionLevel,
    pub units: usize,
    pub skipped: usize,
    pub regions: Vec<AdminRegion>,
    pub pruned: usize,
    pub failed: usize,
    pub duration: Duration,
}

/// Result of all three levels.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub levels: Vec<LevelOutcome>,
    /// Ids of regions, at any level, whose content is unknown because the
    /// unit producing them (or one of their ancestors) failed.
    pub incomplete: BTreeSet<String>,
}

impl SplitOutcome {
    pub fn level(&self, level: RegionLevel) -> Option<&LevelOutcome> {
        self.levels.iter().find(|l| l.level == level)
    }

    pub fn duration(&self, level: RegionLevel) -> Duration {
        self.level(level).map(|l| l.duration).unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }

    /// Surviving municipality files.
    pub fn municipalities(&self) -> &[AdminRegion] {
        self.level(RegionLevel::Municipality)
            .map(|l| l.regions.as_slice())
            .unwrap_or(&[])
    }
}

pub struct RegionSplitter<'a> {
    tool: &'a dyn ExtractionTool,
    limiter: &'a WorkerLimiter,
    policy: FailurePolicy,
    boundaries: &'a BoundariesConfig,
}

impl<'a> RegionSplitter<'a> {
    pub fn new(
        tool: &'a dyn ExtractionTool,
        limiter: &'a WorkerLimiter,
        policy: FailurePolicy,
        boundaries: &'a BoundariesConfig,
    ) -> Self {
        Self {
            tool,
            limiter,
            policy,
            boundaries,
        }
    }

    /// Run all three levels against `country_file`.
    pub async fn split(&self, country_file: &Path, dirs: &RunDirs) -> Result<SplitOutcome> {
        let mut levels = Vec::with_capacity(3);
        let mut incomplete = BTreeSet::new();

        let states_unit = SplitUnit {
            level: RegionLevel::State,
            parent_id: None,
            config: self.boundaries.level1_config.clone(),
            input: country_file.to_path_buf(),
        };
        let states = self
            .run_level(RegionLevel::State, vec![states_unit], 0, dirs, &mut incomplete)
            .await?;
        levels.push(states);

        for (level, config_dir) in [
            (RegionLevel::Microregion, &self.boundaries.level2_dir),
            (RegionLevel::Municipality, &self.boundaries.level3_dir),
        ] {
            let parent_dir = match level {
                RegionLevel::Microregion => dirs.level_dir(RegionLevel::State),
                _ => dirs.level_dir(RegionLevel::Microregion),
            };
            let (units, skipped) = child_units(level, config_dir, &parent_dir, &mut incomplete)?;
            let outcome = self
                .run_level(level, units, skipped, dirs, &mut incomplete)
                .await?;
            levels.push(outcome);
        }

        if !incomplete.is_empty() {
            tracing::warn!(
                regions = incomplete.len(),
                "split finished with failed units; affected regions are incomplete"
            );
        }
        Ok(SplitOutcome { levels, incomplete })
    }

    async fn run_level(
        &self,
        level: RegionLevel,
        units: Vec<SplitUnit>,
        skipped: usize,
        dirs: &RunDirs,
        incomplete: &mut BTreeSet<String>,
    ) -> Result<LevelOutcome> {
        let started = Instant::now();
        let out_dir = dirs.level_dir(level);
        reset_dir(&out_dir).await?;

        tracing::info!(%level, units = units.len(), skipped, "splitting");
        let unit_count = units.len();
        let configs: HashMap<String, PathBuf> = units
            .iter()
            .map(|u| (u.label(), u.config.clone()))
            .collect();
        let tool = self.tool;
        let out = out_dir.as_path();
        let report = self
            .limiter
            .run_all(level.label(), units, |unit| async move {
                tool.extract(&unit.config, &unit.input, out).await?;
                declared_regions(&unit, out)
            })
            .await;
        let stage = report.into_result(self.policy)?;

        for failure in &stage.failed {
            let Some(config) = configs.get(&failure.unit) else {
                continue;
            };
            let outputs = declared_outputs(config).with_context(|| {
                format!("Cannot tell which regions the failed unit '{}' covers", failure.unit)
            })?;
            for output in outputs {
                let path = out_dir.join(&output);
                remove_partial(&path).await?;
                if let Some(id) = region_id(&path) {
                    incomplete.insert(id);
                }
            }
        }
        let failed = stage.failed.len();
        let declared: Vec<AdminRegion> = stage.completed.into_iter().flatten().collect();

        let pruned = self.prune_empty(&out_dir).await?;
        let regions: Vec<AdminRegion> = declared.into_iter().filter(|r| r.path.exists()).collect();

        let duration = started.elapsed();
        tracing::info!(
            %level,
            regions = regions.len(),
            pruned,
            failed,
            duration_ms = duration.as_millis() as u64,
            "split finished"
        );

        Ok(LevelOutcome {
            level,
            units: unit_count,
            skipped,
            regions,
            pruned,
            failed,
            duration,
        })
    }

    /// Delete every file in `dir` with zero features. Returns how many were removed.
    pub async fn prune_empty(&self, dir: &Path) -> Result<usize> {
        let files = list_files(dir)?;
        let tool = self.tool;
        let report = self
            .limiter
            .run_all("prune", files, |path| async move {
                if tool.feature_count(&path).await? == 0 {
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                    tracing::debug!(path = %path.display(), "pruned empty extract");
                    return Ok(true);
                }
                Ok::<bool, anyhow::Error>(false)
            })
            .await;
        let removed = report.into_result(FailurePolicy::Strict)?;
        Ok(removed.completed.into_iter().filter(|r| *r).count())
    }
}

/// Drop whatever a failed extract left behind.
async fn remove_partial(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed output of failed unit");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Build the level-2/3 units: one per config file whose parent output exists.
/// Configs under an incomplete parent are skipped and their regions marked
/// incomplete in turn.
fn child_units(
    level: RegionLevel,
    config_dir: &Path,
    parent_dir: &Path,
    incomplete: &mut BTreeSet<String>,
) -> Result<(Vec<SplitUnit>, usize)> {
    let mut units = Vec::new();
    let mut skipped = 0;
    for config in list_files(config_dir)? {
        let Some(parent_id) = region_id(&config) else {
            continue;
        };
        if incomplete.contains(&parent_id) {
            for output in declared_outputs(&config)? {
                if let Some(id) = region_id(Path::new(&output)) {
                    incomplete.insert(id);
                }
            }
            skipped += 1;
            continue;
        }
        let input = parent_dir.join(format!("{}.osm.pbf", parent_id));
        if !input.exists() {
            tracing::debug!(%level, parent = %parent_id, "parent region empty, skipping");
            skipped += 1;
            continue;
        }
        units.push(SplitUnit {
            level,
            parent_id: Some(parent_id),
            config,
            input,
        });
    }
    Ok((units, skipped))
}

#[derive(Deserialize)]
struct ExtractConfig {
    extracts: Vec<ExtractEntry>,
}

#[derive(Deserialize)]
struct ExtractEntry {
    output: String,
}

/// Output file names listed in an extract config.
fn declared_outputs(config: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(config)
        .with_context(|| format!("Failed to read boundary config: {}", config.display()))?;
    let parsed: ExtractConfig = serde_json::from_str(&content)
        .with_context(|| format!("Invalid boundary config: {}", config.display()))?;
    Ok(parsed.extracts.into_iter().map(|e| e.output).collect())
}

/// The regions an extract config promises to write into `out_dir`.
fn declared_regions(unit: &SplitUnit, out_dir: &Path) -> Result<Vec<AdminRegion>> {
    Ok(declared_outputs(&unit.config)?
        .into_iter()
        .filter_map(|output| {
            let path = out_dir.join(&output);
            let id = region_id(&path)?;
            Some(AdminRegion {
                id,
                level: unit.level,
                parent_id: unit.parent_id.clone(),
                boundary_config: unit.config.clone(),
                path,
            })
        })
        .collect())
}

/// `.../3550308.osm.pbf` → `3550308`.
fn region_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let id = name.split('.').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Regular, non-hidden files in `dir`, sorted by name. A missing directory
/// is treated as empty.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}
