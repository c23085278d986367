//! Daily changefile download.
//!
//! Diffs live at `{base_url}/replication/day/{aaa}/{bbb}/{ccc}.osc.gz`. A 404
//! means the diff has not been published (yet) and is reported as
//! [`FetchOutcome::NotAvailable`]; every other failure is fatal for the run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::PipelineError;
use crate::models::DailyChangeset;
use crate::sequence::SequenceNumber;

/// Result of asking the replication service for one day's diff.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(DailyChangeset),
    NotAvailable,
}

/// A source of daily changefiles.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Download the diff for `sequence` (published for `day`) into `dest_dir`.
    async fn fetch(
        &self,
        day: NaiveDate,
        sequence: SequenceNumber,
        dest_dir: &Path,
    ) -> Result<FetchOutcome>;
}

/// [`DiffSource`] for an HTTP replication server such as planet.osm.org.
pub struct HttpReplication {
    base_url: String,
    client: reqwest::Client,
}

impl HttpReplication {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("osm-for-cities/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn diff_url(&self, sequence: SequenceNumber) -> String {
        diff_url(&self.base_url, sequence)
    }
}

/// Full URL of the daily diff with the given sequence number.
pub fn diff_url(base_url: &str, sequence: SequenceNumber) -> String {
    let [a, b, c] = sequence.path_segments();
    format!(
        "{}/replication/day/{}/{}/{}.osc.gz",
        base_url.trim_end_matches('/'),
        a,
        b,
        c
    )
}

#[async_trait]
impl DiffSource for HttpReplication {
    async fn fetch(
        &self,
        day: NaiveDate,
        sequence: SequenceNumber,
        dest_dir: &Path,
    ) -> Result<FetchOutcome> {
        let url = self.diff_url(sequence);
        tracing::info!(%day, %sequence, %url, "downloading daily changefile");

        let mut resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(%day, %sequence, "changefile is not available");
            return Ok(FetchOutcome::NotAvailable);
        }
        if !resp.status().is_success() {
            return Err(PipelineError::Download {
                url,
                status: resp.status().as_u16(),
            }
            .into());
        }

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        let local_path = dest_dir.join(format!("{}.osc.gz", sequence));
        let partial = partial_path(&local_path);

        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("Download of {} interrupted", url))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, &local_path)
            .await
            .with_context(|| format!("Failed to move {} into place", local_path.display()))?;

        tracing::info!(%sequence, bytes = written, "changefile downloaded");
        Ok(FetchOutcome::Fetched(DailyChangeset {
            day,
            sequence,
            local_path,
        }))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
