//! Publishing the output tree as one git commit per processed day.
//!
//! The output directory is a git working tree. After a day's datasets have
//! been written, everything under it (additions, rewrites and removals of
//! stale artifacts) is staged and committed with author and committer dates
//! set to the closing instant of that day, so `git log` reads as a daily
//! history of the data.
//!
//! A day published with failed regions (best-effort policy) is still
//! committed, but its message carries the list of regions whose artifacts
//! were carried over unchanged.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::GitConfig;
use crate::models::{day_end, format_instant};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record the current state of `dir` as the state at the end of `day`.
    /// `incomplete` names regions whose content was not refreshed that day.
    async fn commit(&self, dir: &Path, day: NaiveDate, incomplete: &[String]) -> Result<()>;
}

pub struct GitStore {
    binary: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitStore {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            binary: PathBuf::from("git"),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str], envs: &[(&str, String)]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn ensure_repo(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        if !dir.join(".git").exists() {
            tracing::info!(dir = %dir.display(), "initialising git repository");
            self.git(dir, &["init", "--quiet"], &[]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for GitStore {
    async fn commit(&self, dir: &Path, day: NaiveDate, incomplete: &[String]) -> Result<()> {
        self.ensure_repo(dir).await?;

        let instant = format_instant(day_end(day));
        let message = format!("Status of {}", instant);
        let envs = [
            ("GIT_AUTHOR_NAME", self.author_name.clone()),
            ("GIT_AUTHOR_EMAIL", self.author_email.clone()),
            ("GIT_AUTHOR_DATE", instant.clone()),
            ("GIT_COMMITTER_NAME", self.author_name.clone()),
            ("GIT_COMMITTER_EMAIL", self.author_email.clone()),
            ("GIT_COMMITTER_DATE", instant.clone()),
        ];

        self.git(dir, &["add", "-A"], &envs).await?;
        let note = format!(
            "Incomplete regions, kept from the previous day: {}",
            incomplete.join(", ")
        );
        let mut args = vec!["commit", "--quiet", "--allow-empty", "-m", message.as_str()];
        if !incomplete.is_empty() {
            args.extend(["-m", note.as_str()]);
        }
        self.git(dir, &args, &envs).await?;
        let sha = self.git(dir, &["rev-parse", "--short", "HEAD"], &[]).await?;

        tracing::info!(%day, commit = %sha, incomplete = incomplete.len(), "committed daily snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_commit_uses_day_end_dates() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("out");
        std::fs::create_dir_all(dir.join("SP/sao-paulo")).unwrap();
        std::fs::write(dir.join("SP/sao-paulo/hospitals.geojson"), "{}").unwrap();

        let store = GitStore::new(&GitConfig::default());
        let day = NaiveDate::from_ymd_opt(2023, 5, 17).unwrap();
        store.commit(&dir, day, &[]).await.unwrap();
        // a day with no changes still gets a commit
        store.commit(&dir, day.succ_opt().unwrap(), &[]).await.unwrap();

        let log = std::process::Command::new("git")
            .args(["log", "--format=%s|%aI|%cI"])
            .current_dir(&dir)
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout);
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "Status of 2023-05-17T23:59:59Z|2023-05-17T23:59:59+00:00|2023-05-17T23:59:59+00:00"
        );
        assert!(lines[0].starts_with("Status of 2023-05-18T23:59:59Z"));
    }

    #[tokio::test]
    async fn test_incomplete_regions_noted_in_message() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("out");
        let store = GitStore::new(&GitConfig::default());
        let day = NaiveDate::from_ymd_opt(2023, 5, 17).unwrap();
        store
            .commit(&dir, day, &["3509502".to_string(), "3550308".to_string()])
            .await
            .unwrap();

        let log = std::process::Command::new("git")
            .args(["log", "--format=%B"])
            .current_dir(&dir)
            .output()
            .unwrap();
        let body = String::from_utf8_lossy(&log.stdout);
        assert!(body.starts_with("Status of 2023-05-17T23:59:59Z"));
        assert!(body.contains("Incomplete regions, kept from the previous day: 3509502, 3550308"));
    }
}
