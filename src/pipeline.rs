//! The replication loop and the daily extraction loop.
//!
//! # Replication (`ofc update`)
//!
//! ```text
//! EnsureBaseExists → LoadOrInitCursor → CheckUpToDate ─┬─ up to date → stop
//!                                                      └─ target day → Fetch ─┬─ not available → stop
//!                                                                             └─ ApplyDiff
//!   → [Extract: time-filter → split → datasets → stats → commit]
//!   → SaveCursor → [upload] → next day (with --recursive) or stop
//! ```
//!
//! Each day runs in its own scratch directory under `<work_dir>/runs/`.
//! The loop is iterative; a multi-year catch-up is one loop, not a chain of
//! nested calls.
//!
//! # Extraction (`ofc extract`)
//!
//! Replays extraction for days the history already covers, using the stats
//! series as its cursor: the next day is the day after the last recorded
//! one, and the loop ends once it would pass the replication cursor.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::commit::{GitStore, HistoryStore};
use crate::config::Config;
use crate::cursor::{CursorStore, ReplicationCursor};
use crate::datasets::DatasetExtractor;
use crate::error::PipelineError;
use crate::fanout::WorkerLimiter;
use crate::fetch::{DiffSource, FetchOutcome, HttpReplication};
use crate::models::{day_end, Dataset, Municipality, RegionLevel};
use crate::osmium::{ExtractionTool, Osmium};
use crate::reference::{combined_filters, load_datasets, load_municipalities};
use crate::sequence::{SequenceClock, SequenceNumber};
use crate::snapshot::SnapshotUpdater;
use crate::split::RegionSplitter;
use crate::stats::{output_size, StageDurations, StatsRecord, StatsRecorder};
use crate::storage::ObjectStore;
use crate::workdir::RunDirs;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Keep going until up to date or the next diff is unavailable.
    pub recursive: bool,
    /// Split and extract datasets for each applied day.
    pub extract: bool,
    /// Pull the history from object storage at start, push after each day.
    pub s3: bool,
}

/// Why a loop ended. None of these are failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    UpToDate { last_day: NaiveDate },
    NotYetPublished { day: NaiveDate, sequence: SequenceNumber },
    /// The diff is missing although it is old enough that it should exist.
    PossibleGap { day: NaiveDate, sequence: SequenceNumber },
    /// One day was processed and the loop was not asked to continue.
    SingleStep,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub days: Vec<NaiveDate>,
    pub stop: StopReason,
}

/// Outcome of extracting one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayExtraction {
    /// The country snapshot had no features at that day; recorded, not committed.
    Empty,
    /// Already present in the stats series.
    AlreadyRecorded,
    Published {
        municipalities: usize,
        artifacts: usize,
        /// Regions carried over from the previous day after failed units.
        incomplete: Vec<String>,
    },
}

/// Reference data needed by the extraction stages.
struct Reference {
    municipalities: Vec<Municipality>,
    datasets: Vec<Dataset>,
}

pub struct Pipeline {
    config: Config,
    clock: SequenceClock,
    limiter: WorkerLimiter,
    tool: Arc<dyn ExtractionTool>,
    diffs: Arc<dyn DiffSource>,
    history: Arc<dyn HistoryStore>,
    objects: Option<Arc<dyn ObjectStore>>,
    today: Option<NaiveDate>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        tool: Arc<dyn ExtractionTool>,
        diffs: Arc<dyn DiffSource>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            clock: SequenceClock::new(config.replication.epoch),
            limiter: WorkerLimiter::new(config.extraction.concurrency),
            config,
            tool,
            diffs,
            history,
            objects: None,
            today: None,
        }
    }

    /// osmium on the command line, HTTP replication, git.
    pub fn from_config(config: Config) -> Result<Self> {
        let tool = Arc::new(Osmium::new(config.osmium.binary.clone()));
        let diffs = Arc::new(HttpReplication::new(
            &config.replication.base_url,
            config.replication.timeout_secs,
        )?);
        let history = Arc::new(GitStore::new(&config.git));
        Ok(Self::new(config, tool, diffs, history))
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(store);
        self
    }

    /// Fix "today" instead of reading the system clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn clock(&self) -> &SequenceClock {
        &self.clock
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn cursor_store(&self) -> CursorStore {
        CursorStore::new(self.config.paths.cursor_path())
    }

    fn stats(&self) -> StatsRecorder {
        StatsRecorder::new(self.config.paths.stats_path())
    }

    /// Advance the history file by daily diffs.
    pub async fn run_update(&self, opts: RunOptions) -> Result<RunSummary> {
        if opts.s3 {
            self.pull_from_storage().await?;
        }

        let history = &self.config.paths.history_file;
        ensure_history_exists(history)?;

        let cursor_store = self.cursor_store();
        let mut cursor = self.load_or_init_cursor(&cursor_store).await?;

        let needs_datasets = opts.extract || self.config.replication.prefilter;
        let reference = self.load_reference(needs_datasets, opts.extract)?;
        let prefilter = if self.config.replication.prefilter {
            combined_filters(&reference.datasets)
        } else {
            Vec::new()
        };

        let today = self.today();
        let mut days = Vec::new();

        let stop = loop {
            let last = cursor.last_applied_day();
            if self.clock.is_up_to_date(last, today) {
                tracing::info!(last_day = %last, "history is up to date");
                break StopReason::UpToDate { last_day: last };
            }

            let day = self.clock.target_day(last);
            let sequence = self.clock.sequence_for_day(day)?;
            let dirs = RunDirs::create(&self.config.paths.work_dir).await?;
            tracing::info!(%day, %sequence, run = dirs.run_id(), "processing day");

            let changeset = match self
                .diffs
                .fetch(day, sequence, &dirs.history_dir())
                .await?
            {
                FetchOutcome::Fetched(changeset) => changeset,
                FetchOutcome::NotAvailable => {
                    dirs.cleanup().await?;
                    break self.not_available(day, sequence, today);
                }
            };

            SnapshotUpdater::new(self.tool.as_ref())
                .with_prefilter(prefilter.clone())
                .apply(history, &changeset, dirs.run_id())
                .await?;

            if opts.extract {
                self.extract_day(day, &dirs, &reference).await?;
            }

            cursor = self.save_cursor(&cursor_store, day, sequence).await?;

            if opts.s3 {
                self.push_to_storage().await?;
            }
            dirs.cleanup().await?;
            days.push(day);

            if !opts.recursive {
                break StopReason::SingleStep;
            }
        };

        Ok(RunSummary { days, stop })
    }

    /// Extract days the history already covers, starting after the last
    /// recorded stats day.
    pub async fn run_extract(&self, recursive: bool) -> Result<RunSummary> {
        let history = &self.config.paths.history_file;
        ensure_history_exists(history)?;

        let cursor_store = self.cursor_store();
        let cursor = cursor_store.load().await?.ok_or_else(|| {
            anyhow!(
                "No replication cursor at {}; run `ofc update` or `ofc cursor refresh` first",
                cursor_store.path().display()
            )
        })?;
        let covered_until = cursor.last_applied_day();
        let reference = self.load_reference(true, true)?;
        let recorder = self.stats();

        let mut days = Vec::new();
        let stop = loop {
            let next = match recorder.last_processed_day()? {
                Some(last) => last
                    .succ_opt()
                    .with_context(|| format!("No day after {}", last))?,
                None => self.config.extraction.start_date,
            };
            if next > covered_until {
                tracing::info!(last_day = %covered_until, "extraction is up to date");
                break StopReason::UpToDate {
                    last_day: covered_until,
                };
            }

            let dirs = RunDirs::create(&self.config.paths.work_dir).await?;
            tracing::info!(day = %next, run = dirs.run_id(), "extracting day");
            self.extract_day(next, &dirs, &reference).await?;
            dirs.cleanup().await?;
            days.push(next);

            if !recursive {
                break StopReason::SingleStep;
            }
        };

        Ok(RunSummary { days, stop })
    }

    /// Re-read the cursor timestamps from the history file.
    pub async fn refresh_cursor(&self) -> Result<ReplicationCursor> {
        let history = &self.config.paths.history_file;
        ensure_history_exists(history)?;
        self.cursor_store()
            .refresh_from_snapshot(self.tool.as_ref(), history)
            .await
    }

    async fn load_or_init_cursor(&self, store: &CursorStore) -> Result<ReplicationCursor> {
        match store.load().await? {
            Some(cursor) => Ok(cursor),
            None => {
                tracing::info!(
                    path = %store.path().display(),
                    "no cursor yet, reading timestamps from history file"
                );
                store
                    .refresh_from_snapshot(self.tool.as_ref(), &self.config.paths.history_file)
                    .await
            }
        }
    }

    async fn save_cursor(
        &self,
        store: &CursorStore,
        day: NaiveDate,
        sequence: SequenceNumber,
    ) -> Result<ReplicationCursor> {
        let mut cursor = store
            .merged_with_snapshot(self.tool.as_ref(), &self.config.paths.history_file)
            .await?;
        cursor.mark_applied(day);
        cursor.set_extra("lastSequence", sequence.to_string());
        store.save(&cursor).await?;
        Ok(cursor)
    }

    fn not_available(&self, day: NaiveDate, sequence: SequenceNumber, today: NaiveDate) -> StopReason {
        let age = (today - day).num_days();
        if age > self.config.replication.gap_warning_days {
            tracing::warn!(
                %day,
                %sequence,
                age_days = age,
                "changefile missing although it should be published; possible replication gap"
            );
            StopReason::PossibleGap { day, sequence }
        } else {
            tracing::info!(%day, %sequence, "changefile not published yet");
            StopReason::NotYetPublished { day, sequence }
        }
    }

    fn load_reference(&self, datasets: bool, municipalities: bool) -> Result<Reference> {
        Ok(Reference {
            datasets: if datasets {
                load_datasets(&self.config.reference.datasets)?
            } else {
                Vec::new()
            },
            municipalities: if municipalities {
                load_municipalities(&self.config.reference.municipalities)?
            } else {
                Vec::new()
            },
        })
    }

    /// Time-filter the history at the end of `day`, split it, extract all
    /// datasets, record stats and commit the output tree.
    async fn extract_day(
        &self,
        day: NaiveDate,
        dirs: &RunDirs,
        reference: &Reference,
    ) -> Result<DayExtraction> {
        let recorder = self.stats();
        if recorder.last_processed_day()?.is_some_and(|last| last >= day) {
            tracing::info!(%day, "day already extracted, skipping");
            return Ok(DayExtraction::AlreadyRecorded);
        }

        let started = Instant::now();
        let mut durations = StageDurations::default();
        let output_dir = &self.config.paths.output_dir;
        let policy = self.config.extraction.failure_policy;

        let current = dirs.current_day_file();
        if let Some(parent) = current.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let stage = Instant::now();
        self.tool
            .time_filter(&self.config.paths.history_file, day_end(day), &current)
            .await?;
        durations.filtering = stage.elapsed();
        tracing::info!(
            %day,
            duration_ms = durations.filtering.as_millis() as u64,
            "history time-filtered"
        );

        if self.tool.feature_count(&current).await? == 0 {
            tracing::info!(%day, "no features at this day, nothing to publish");
            durations.total = started.elapsed();
            recorder
                .append(StatsRecord::new(day, &durations, output_size(output_dir)))
                .await?;
            return Ok(DayExtraction::Empty);
        }

        let split = RegionSplitter::new(
            self.tool.as_ref(),
            &self.limiter,
            policy,
            &self.config.boundaries,
        )
        .split(&current, dirs)
        .await?;
        durations.split_states = split.duration(RegionLevel::State);
        durations.split_microregions = split.duration(RegionLevel::Microregion);
        durations.split_municipalities = split.duration(RegionLevel::Municipality);

        let extracted = DatasetExtractor::new(self.tool.as_ref(), &self.limiter, policy, output_dir)
            .extract_all(
                &reference.municipalities,
                &reference.datasets,
                &dirs.level_dir(RegionLevel::Municipality),
                &dirs.datasets_dir(),
                &split.incomplete,
            )
            .await?;
        durations.datasets = extracted.duration;
        durations.total = started.elapsed();

        let incomplete: Vec<String> = split
            .incomplete
            .iter()
            .cloned()
            .chain(extracted.failed.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !incomplete.is_empty() {
            tracing::warn!(%day, regions = ?incomplete, "publishing day with incomplete regions");
        }

        let record = StatsRecord::new(day, &durations, output_size(output_dir))
            .with_counts(extracted.municipalities, extracted.artifacts_written)
            .with_incomplete(incomplete.clone());
        recorder.append(record).await?;
        if let Err(err) = self.history.commit(output_dir, day, &incomplete).await {
            // Without its commit the day is not processed; the next run redoes it.
            recorder
                .retract(day)
                .await
                .with_context(|| format!("Failed to retract stats for {} after commit failure", day))?;
            return Err(err.context(format!("Failed to commit {}", day)));
        }

        tracing::info!(
            %day,
            municipalities = extracted.municipalities,
            artifacts = extracted.artifacts_written,
            duration_ms = durations.total.as_millis() as u64,
            "day published"
        );
        Ok(DayExtraction::Published {
            municipalities: extracted.municipalities,
            artifacts: extracted.artifacts_written,
            incomplete,
        })
    }

    fn object_store(&self) -> Result<(&dyn ObjectStore, &crate::config::S3Config)> {
        let s3 = self
            .config
            .s3
            .as_ref()
            .context("--s3 requires an [s3] section in the config")?;
        let store = self
            .objects
            .as_deref()
            .context("--s3 requires an object store")?;
        Ok((store, s3))
    }

    async fn pull_from_storage(&self) -> Result<()> {
        let (store, s3) = self.object_store()?;
        let paths = &self.config.paths;
        if !store.download(&s3.history_key, &paths.history_file).await? {
            tracing::warn!(key = %s3.history_key, "history file not in object storage");
        }
        if !store.download(&s3.cursor_key, &paths.cursor_path()).await? {
            tracing::warn!(key = %s3.cursor_key, "cursor file not in object storage");
        }
        Ok(())
    }

    async fn push_to_storage(&self) -> Result<()> {
        let (store, s3) = self.object_store()?;
        let paths = &self.config.paths;
        store.upload(&paths.history_file, &s3.history_key).await?;
        store.upload(&paths.cursor_path(), &s3.cursor_key).await?;
        Ok(())
    }
}

fn ensure_history_exists(path: &std::path::Path) -> Result<()> {
    if !path.is_file() {
        return Err(PipelineError::MissingSnapshot(path.to_path_buf()).into());
    }
    Ok(())
}
