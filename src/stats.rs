//! Per-day run metrics and the `ofc status` overview.
//!
//! Every fully processed day appends one [`StatsRecord`] to a JSON array
//! kept next to the published GeoJSON tree. The series is both the data
//! behind the public statistics page and the durable marker of the last
//! day the extraction loop finished.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::Config;
use crate::cursor::{describe_snapshot, CursorStore};
use crate::workdir::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsRecord {
    /// The processed day.
    pub updated_at: NaiveDate,
    pub output_size_kb: u64,
    pub task_duration_ms: u64,
    pub filtering_duration_ms: u64,
    pub split_states_duration_ms: u64,
    pub split_microregions_duration_ms: u64,
    pub split_municipalities_duration_ms: u64,
    pub datasets_duration_ms: u64,
    #[serde(default)]
    pub municipalities: usize,
    #[serde(default)]
    pub artifacts: usize,
    /// Regions whose artifacts were carried over because their units failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete: Vec<String>,
}

/// Wall-clock time spent in each stage of one day.
#[derive(Debug, Clone, Default)]
pub struct StageDurations {
    pub filtering: Duration,
    pub split_states: Duration,
    pub split_microregions: Duration,
    pub split_municipalities: Duration,
    pub datasets: Duration,
    pub total: Duration,
}

impl StatsRecord {
    pub fn new(day: NaiveDate, durations: &StageDurations, output_bytes: u64) -> Self {
        Self {
            updated_at: day,
            output_size_kb: output_bytes / 1024,
            task_duration_ms: millis(durations.total),
            filtering_duration_ms: millis(durations.filtering),
            split_states_duration_ms: millis(durations.split_states),
            split_microregions_duration_ms: millis(durations.split_microregions),
            split_municipalities_duration_ms: millis(durations.split_municipalities),
            datasets_duration_ms: millis(durations.datasets),
            municipalities: 0,
            artifacts: 0,
            incomplete: Vec::new(),
        }
    }

    pub fn with_counts(mut self, municipalities: usize, artifacts: usize) -> Self {
        self.municipalities = municipalities;
        self.artifacts = artifacts;
        self
    }

    pub fn with_incomplete(mut self, regions: Vec<String>) -> Self {
        self.incomplete = regions;
        self
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

pub struct StatsRecorder {
    path: PathBuf,
}

impl StatsRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in file order. A missing file is an empty series.
    pub fn load(&self) -> Result<Vec<StatsRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read stats file: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse stats file: {}", self.path.display()))
    }

    pub fn last_processed_day(&self) -> Result<Option<NaiveDate>> {
        Ok(self.load()?.iter().map(|r| r.updated_at).max())
    }

    /// Append one record. Days must be appended in increasing order.
    pub async fn append(&self, record: StatsRecord) -> Result<()> {
        let mut records = self.load()?;
        if let Some(last) = records.last() {
            if record.updated_at <= last.updated_at {
                bail!(
                    "Stats already contain {} (last recorded day {})",
                    record.updated_at,
                    last.updated_at
                );
            }
        }
        tracing::info!(
            day = %record.updated_at,
            output_kb = record.output_size_kb,
            task_ms = record.task_duration_ms,
            "recording stats"
        );
        records.push(record);
        self.write(&records).await
    }

    /// Drop the record for `day` if it is the last one. Used when the day
    /// could not be committed after its record was appended.
    pub async fn retract(&self, day: NaiveDate) -> Result<bool> {
        let mut records = self.load()?;
        if records.last().map(|r| r.updated_at) != Some(day) {
            return Ok(false);
        }
        records.pop();
        tracing::info!(%day, "retracting stats record");
        self.write(&records).await?;
        Ok(true)
    }

    async fn write(&self, records: &[StatsRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        write_atomic(&self.path, &json).await
    }
}

/// Total size of all files below `dir`, ignoring any `.git` directory.
pub fn output_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// `ofc status`: snapshot, cursor and the tail of the stats series.
pub async fn run_status(config: &Config) -> Result<()> {
    let history = &config.paths.history_file;
    let cursor_store = CursorStore::new(config.paths.cursor_path());
    let recorder = StatsRecorder::new(config.paths.stats_path());

    println!("OSM for Cities Pipeline Status");
    println!("================================");
    println!();
    println!("  History:     {}", history.display());
    match cursor_store.load().await? {
        Some(cursor) if history.is_file() => {
            let snapshot = describe_snapshot(history, &cursor).await?;
            println!("  Size:        {}", format_bytes(snapshot.size_bytes));
            print_replicated(snapshot.first_timestamp, snapshot.last_timestamp);
        }
        Some(cursor) => {
            println!("  Size:        (missing)");
            print_replicated(cursor.elements.first_timestamp, cursor.elements.last_timestamp);
        }
        None => {
            match std::fs::metadata(history) {
                Ok(meta) => println!("  Size:        {}", format_bytes(meta.len())),
                Err(_) => println!("  Size:        (missing)"),
            }
            println!("  Replicated:  no cursor at {}", cursor_store.path().display());
        }
    }

    let records = recorder.load()?;
    println!();
    println!("  Output:      {}", config.paths.output_dir.display());
    println!(
        "  Size:        {}",
        format_bytes(output_size(&config.paths.output_dir))
    );
    println!("  Days:        {}", records.len());

    if !records.is_empty() {
        println!();
        println!(
            "  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "DAY", "TOTAL", "FILTER", "STATES", "MICRO", "MUNI", "DATASETS"
        );
        println!("  {}", "-".repeat(78));
        for r in records.iter().rev().take(10) {
            println!(
                "  {:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                r.updated_at.to_string(),
                format_ms(r.task_duration_ms),
                format_ms(r.filtering_duration_ms),
                format_ms(r.split_states_duration_ms),
                format_ms(r.split_microregions_duration_ms),
                format_ms(r.split_municipalities_duration_ms),
                format_ms(r.datasets_duration_ms),
            );
            if !r.incomplete.is_empty() {
                println!("  {:<12} incomplete: {}", "", r.incomplete.join(", "));
            }
        }
        if let Ok(meta) = std::fs::metadata(recorder.path()) {
            if let Ok(modified) = meta.modified() {
                let ts = chrono::DateTime::<Utc>::from(modified).timestamp();
                println!();
                println!("  Last run:    {}", format_ts_relative(ts));
            }
        }
    }

    println!();
    Ok(())
}

fn print_replicated(first: DateTime<Utc>, last: DateTime<Utc>) {
    println!(
        "  Replicated:  {} to {}",
        first.format("%Y-%m-%d"),
        last.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Behind:      {} day(s)",
        (Utc::now().date_naive() - last.date_naive()).num_days().max(0)
    );
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Relative time ("3 hours ago") for recent timestamps, a date otherwise.
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_append_and_last_processed_day() {
        let tmp = TempDir::new().unwrap();
        let recorder = StatsRecorder::new(tmp.path().join("stats.json"));
        assert_eq!(recorder.last_processed_day().unwrap(), None);

        let durations = StageDurations {
            filtering: Duration::from_millis(1500),
            total: Duration::from_secs(4),
            ..Default::default()
        };
        recorder
            .append(StatsRecord::new(day("2023-01-01"), &durations, 4096))
            .await
            .unwrap();
        recorder
            .append(StatsRecord::new(day("2023-01-02"), &durations, 8192).with_counts(2, 5))
            .await
            .unwrap();

        let records = recorder.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output_size_kb, 8);
        assert_eq!(records[1].artifacts, 5);
        assert_eq!(records[0].filtering_duration_ms, 1500);
        assert_eq!(recorder.last_processed_day().unwrap(), Some(day("2023-01-02")));
    }

    #[tokio::test]
    async fn test_append_rejects_repeated_day() {
        let tmp = TempDir::new().unwrap();
        let recorder = StatsRecorder::new(tmp.path().join("stats.json"));
        let d = StageDurations::default();
        recorder
            .append(StatsRecord::new(day("2023-01-02"), &d, 0))
            .await
            .unwrap();
        assert!(recorder
            .append(StatsRecord::new(day("2023-01-02"), &d, 0))
            .await
            .is_err());
        assert_eq!(recorder.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retract_only_removes_last_day() {
        let tmp = TempDir::new().unwrap();
        let recorder = StatsRecorder::new(tmp.path().join("stats.json"));
        let d = StageDurations::default();
        for s in ["2023-01-01", "2023-01-02"] {
            recorder.append(StatsRecord::new(day(s), &d, 0)).await.unwrap();
        }

        assert!(!recorder.retract(day("2023-01-01")).await.unwrap());
        assert!(recorder.retract(day("2023-01-02")).await.unwrap());
        assert_eq!(recorder.last_processed_day().unwrap(), Some(day("2023-01-01")));

        // The day can be recorded again once retracted.
        recorder
            .append(StatsRecord::new(day("2023-01-02"), &d, 0))
            .await
            .unwrap();
        assert_eq!(recorder.load().unwrap().len(), 2);
    }

    #[test]
    fn test_record_json_keys() {
        let r = StatsRecord::new(day("2023-03-04"), &StageDurations::default(), 0);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["updatedAt"], "2023-03-04");
        assert!(json.get("splitMicroregionsDurationMs").is_some());
        assert!(json.get("outputSizeKb").is_some());
        assert!(json.get("incomplete").is_none());

        let partial = r.with_incomplete(vec!["3550308".into()]);
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["incomplete"], serde_json::json!(["3550308"]));
    }

    #[test]
    fn test_output_size_skips_git() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(tmp.path().join("SP/sao-paulo")).unwrap();
        std::fs::write(tmp.path().join(".git/objects/blob"), vec![0u8; 5000]).unwrap();
        std::fs::write(tmp.path().join("SP/sao-paulo/hospitals.geojson"), vec![0u8; 300]).unwrap();
        assert_eq!(output_size(tmp.path()), 300);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_ms(250), "250ms");
        assert_eq!(format_ms(90_500), "1m30s");
    }
}
