//! External extraction tool.
//!
//! Everything that needs to understand the binary OSM formats is delegated
//! to [osmium-tool](https://osmcode.org/osmium-tool/) running as a
//! subprocess. The pipeline only talks to the [`ExtractionTool`] trait so
//! tests can substitute an in-memory implementation.
//!
//! | Operation | osmium command |
//! |-----------|----------------|
//! | [`timestamps`](ExtractionTool::timestamps) | `fileinfo -e -j` |
//! | [`feature_count`](ExtractionTool::feature_count) | `fileinfo -e -j` |
//! | [`apply_changes`](ExtractionTool::apply_changes) | `apply-changes` |
//! | [`time_filter`](ExtractionTool::time_filter) | `time-filter` |
//! | [`extract`](ExtractionTool::extract) | `extract -c <config> -d <dir>` |
//! | [`tags_filter`](ExtractionTool::tags_filter) | `tags-filter` |
//! | [`export_geojson`](ExtractionTool::export_geojson) | `export -f geojson` |
//!
//! Any non-zero exit status becomes [`PipelineError::Subprocess`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::PipelineError;
use crate::models::format_instant;

/// First and last object timestamps embedded in an OSM file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTimestamps {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

#[async_trait]
pub trait ExtractionTool: Send + Sync {
    /// Read the first/last object timestamps of a file.
    async fn timestamps(&self, path: &Path) -> Result<FileTimestamps>;

    /// Number of OSM objects (nodes + ways + relations) in a file.
    async fn feature_count(&self, path: &Path) -> Result<u64>;

    /// Apply a change file to a history file, writing a new file to `output`.
    async fn apply_changes(&self, base: &Path, diff: &Path, output: &Path) -> Result<()>;

    /// Keep only the history relevant to the state of the data at `at`.
    async fn time_filter(&self, input: &Path, at: DateTime<Utc>, output: &Path) -> Result<()>;

    /// Cut `input` along every boundary of `config`, writing one file per
    /// configured extract into `output_dir`.
    async fn extract(&self, config: &Path, input: &Path, output_dir: &Path) -> Result<()>;

    /// Keep objects matching any of the tag-filter `expressions`.
    async fn tags_filter(&self, input: &Path, expressions: &[String], output: &Path)
        -> Result<()>;

    /// Convert a file to a GeoJSON FeatureCollection.
    async fn export_geojson(&self, input: &Path) -> Result<Value>;
}

/// [`ExtractionTool`] backed by the `osmium` command line tool.
#[derive(Debug, Clone)]
pub struct Osmium {
    binary: PathBuf,
}

impl Osmium {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run osmium with `args`, returning stdout on success.
    async fn run(&self, args: Vec<OsString>) -> Result<Vec<u8>> {
        let program = self.binary.display().to_string();
        let rendered = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(command = %format!("{} {}", program, rendered), "running osmium");

        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is osmium installed?", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Subprocess {
                program,
                args: rendered,
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(2000).collect(),
            }
            .into());
        }

        Ok(output.stdout)
    }

    async fn fileinfo(&self, path: &Path) -> Result<Value> {
        let stdout = self
            .run(vec![
                "fileinfo".into(),
                "--extended".into(),
                "--json".into(),
                path.into(),
            ])
            .await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Unparseable osmium fileinfo output for {}", path.display()))
    }
}

#[async_trait]
impl ExtractionTool for Osmium {
    async fn timestamps(&self, path: &Path) -> Result<FileTimestamps> {
        let info = self.fileinfo(path).await?;
        parse_timestamps(&info)
            .with_context(|| format!("No timestamps in {}", path.display()))
    }

    async fn feature_count(&self, path: &Path) -> Result<u64> {
        let info = self.fileinfo(path).await?;
        Ok(count_objects(&info))
    }

    async fn apply_changes(&self, base: &Path, diff: &Path, output: &Path) -> Result<()> {
        self.run(vec![
            "apply-changes".into(),
            "--overwrite".into(),
            base.into(),
            diff.into(),
            "-o".into(),
            output.into(),
        ])
        .await?;
        Ok(())
    }

    async fn time_filter(&self, input: &Path, at: DateTime<Utc>, output: &Path) -> Result<()> {
        self.run(vec![
            "time-filter".into(),
            input.into(),
            format_instant(at).into(),
            "--overwrite".into(),
            "-o".into(),
            output.into(),
        ])
        .await?;
        Ok(())
    }

    async fn extract(&self, config: &Path, input: &Path, output_dir: &Path) -> Result<()> {
        self.run(vec![
            "extract".into(),
            "-c".into(),
            config.into(),
            "-d".into(),
            output_dir.into(),
            input.into(),
            "--overwrite".into(),
        ])
        .await?;
        Ok(())
    }

    async fn tags_filter(
        &self,
        input: &Path,
        expressions: &[String],
        output: &Path,
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec!["tags-filter".into(), input.into()];
        args.extend(expressions.iter().map(OsString::from));
        args.push("--overwrite".into());
        args.push("-o".into());
        args.push(output.into());
        self.run(args).await?;
        Ok(())
    }

    async fn export_geojson(&self, input: &Path) -> Result<Value> {
        let stdout = self
            .run(vec![
                "export".into(),
                input.into(),
                "-f".into(),
                "geojson".into(),
                "--attributes=type,id,version,timestamp".into(),
            ])
            .await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Unparseable GeoJSON exported from {}", input.display()))
    }
}

/// Pull `data.timestamp.{first,last}` out of `osmium fileinfo -e -j` output.
fn parse_timestamps(info: &Value) -> Option<FileTimestamps> {
    let ts = info.get("data")?.get("timestamp")?;
    let parse = |key: &str| {
        ts.get(key)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Some(FileTimestamps {
        first: parse("first")?,
        last: parse("last")?,
    })
}

/// Sum of `data.count.{nodes,ways,relations}`; zero when absent.
fn count_objects(info: &Value) -> u64 {
    let Some(count) = info.get("data").and_then(|d| d.get("count")) else {
        return 0;
    };
    ["nodes", "ways", "relations"]
        .iter()
        .filter_map(|k| count.get(*k).and_then(Value::as_u64))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamps() {
        let info = json!({
            "data": {
                "timestamp": {
                    "first": "2007-10-08T12:00:01Z",
                    "last": "2024-03-09T23:59:57Z"
                }
            }
        });
        let ts = parse_timestamps(&info).unwrap();
        assert_eq!(format_instant(ts.first), "2007-10-08T12:00:01Z");
        assert_eq!(format_instant(ts.last), "2024-03-09T23:59:57Z");
    }

    #[test]
    fn test_empty_file_has_no_timestamps() {
        let info = json!({ "data": { "count": { "nodes": 0, "ways": 0, "relations": 0 } } });
        assert!(parse_timestamps(&info).is_none());
        assert_eq!(count_objects(&info), 0);
    }

    #[test]
    fn test_count_objects() {
        let info = json!({ "data": { "count": { "nodes": 12, "ways": 3, "relations": 1 } } });
        assert_eq!(count_objects(&info), 16);
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let tool = Osmium::new("/nonexistent/osmium-binary");
        let err = tool.feature_count(Path::new("x.osm.pbf")).await.unwrap_err();
        assert!(err.to_string().contains("Is osmium installed"));
    }
}
