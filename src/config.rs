//! TOML configuration parsing.
//!
//! Every command reads one configuration file (`--config`, default
//! `./config/ofc.toml`). Sections map one-to-one onto the pipeline
//! components; optional sections fall back to the defaults below.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub osmium: OsmiumConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub boundaries: BoundariesConfig,
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub history_file: PathBuf,
    #[serde(default)]
    pub cursor_file: Option<PathBuf>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub stats_file: Option<PathBuf>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("tmp")
}

impl PathsConfig {
    /// Cursor metadata file; defaults to `<history_file>.json`.
    pub fn cursor_path(&self) -> PathBuf {
        match &self.cursor_file {
            Some(path) => path.clone(),
            None => {
                let mut name = self.history_file.as_os_str().to_owned();
                name.push(".json");
                PathBuf::from(name)
            }
        }
    }

    /// Stats time series; defaults to `<output_dir>/stats.json`.
    pub fn stats_path(&self) -> PathBuf {
        self.stats_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("stats.json"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_epoch")]
    pub epoch: NaiveDate,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_gap_warning_days")]
    pub gap_warning_days: i64,
    #[serde(default = "default_prefilter")]
    pub prefilter: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            epoch: default_epoch(),
            timeout_secs: default_timeout_secs(),
            gap_warning_days: default_gap_warning_days(),
            prefilter: default_prefilter(),
        }
    }
}

fn default_base_url() -> String {
    "https://planet.osm.org".to_string()
}

/// First day a daily changefile was published on planet.osm.org.
pub fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2012, 9, 12).unwrap_or_default()
}

fn default_timeout_secs() -> u64 {
    600
}
fn default_gap_warning_days() -> i64 {
    3
}
fn default_prefilter() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct OsmiumConfig {
    #[serde(default = "default_osmium_binary")]
    pub binary: PathBuf,
}

impl Default for OsmiumConfig {
    fn default() -> Self {
        Self {
            binary: default_osmium_binary(),
        }
    }
}

fn default_osmium_binary() -> PathBuf {
    PathBuf::from("osmium")
}

/// What to do when some units of a fan-out stage fail.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Drain the stage, then fail the run if any unit failed.
    #[default]
    Strict,
    /// Drain the stage, log failures, and keep going.
    BestEffort,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_policy: FailurePolicy::default(),
            start_date: default_start_date(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoundariesConfig {
    pub level1_config: PathBuf,
    pub level2_dir: PathBuf,
    pub level3_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReferenceConfig {
    pub municipalities: PathBuf,
    pub datasets: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

fn default_author_name() -> String {
    "OSM for Cities".to_string()
}
fn default_author_email() -> String {
    "bot@osmforcities.org".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_history_key")]
    pub history_key: String,
    #[serde(default = "default_cursor_key")]
    pub cursor_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_history_key() -> String {
    "presets-history.osh.pbf".to_string()
}
fn default_cursor_key() -> String {
    "presets-history.osh.pbf.json".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.extraction.concurrency == 0 {
        bail!("extraction.concurrency must be >= 1");
    }

    if config.replication.base_url.trim().is_empty() {
        bail!("replication.base_url must not be empty");
    }

    if config.replication.gap_warning_days < 1 {
        bail!("replication.gap_warning_days must be >= 1");
    }

    if let Some(s3) = &config.s3 {
        if s3.bucket.is_empty() {
            bail!("s3.bucket must not be empty");
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[paths]
history_file = "data/history/presets-history.osh.pbf"
output_dir = "data/git"

[boundaries]
level1_config = "osmium/level-1.json"
level2_dir = "osmium/level-2"
level3_dir = "osmium/level-3"

[reference]
municipalities = "config/municipalities.json"
datasets = "config/datasets.json"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.extraction.concurrency, 5);
        assert_eq!(cfg.extraction.failure_policy, FailurePolicy::Strict);
        assert_eq!(cfg.replication.epoch, NaiveDate::from_ymd_opt(2012, 9, 12).unwrap());
        assert_eq!(cfg.replication.base_url, "https://planet.osm.org");
        assert!(cfg.s3.is_none());
        assert_eq!(
            cfg.paths.cursor_path(),
            PathBuf::from("data/history/presets-history.osh.pbf.json")
        );
        assert_eq!(cfg.paths.stats_path(), PathBuf::from("data/git/stats.json"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let content = format!("{}\n[extraction]\nconcurrency = 0\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_best_effort_policy_parses() {
        let content = format!("{}\n[extraction]\nfailure_policy = \"best-effort\"\n", MINIMAL);
        let cfg = parse_config(&content).unwrap();
        assert_eq!(cfg.extraction.failure_policy, FailurePolicy::BestEffort);
    }
}
