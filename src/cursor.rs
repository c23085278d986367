//! Replication cursor persistence.
//!
//! The cursor is a JSON file stored next to the history snapshot:
//!
//! ```json
//! {
//!   "elements": {
//!     "firstTimestamp": "2007-10-08T12:00:01Z",
//!     "lastTimestamp": "2024-03-09T23:59:59Z"
//!   },
//!   "lastSequence": "000004197"
//! }
//! ```
//!
//! Only `elements` is interpreted; every other top-level key is carried
//! through loads, refreshes, and saves untouched.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::models::{day_end, HistorySnapshot};
use crate::osmium::ExtractionTool;
use crate::workdir::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorElements {
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationCursor {
    pub elements: CursorElements,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplicationCursor {
    /// Calendar day of the last applied edit.
    pub fn last_applied_day(&self) -> NaiveDate {
        self.elements.last_timestamp.date_naive()
    }

    /// Record that the diff for `day` has been applied. The snapshot's own
    /// last timestamp can lag behind when no matching edit happened that day.
    pub fn mark_applied(&mut self, day: NaiveDate) {
        let end = day_end(day);
        if self.elements.last_timestamp < end {
            self.elements.last_timestamp = end;
        }
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }
}

/// Loads and saves a [`ReplicationCursor`] at a fixed path.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no cursor file exists yet.
    pub async fn load(&self) -> Result<Option<ReplicationCursor>> {
        let Some(raw) = self.load_raw().await? else {
            return Ok(None);
        };
        let cursor = serde_json::from_value(Value::Object(raw))
            .with_context(|| format!("Invalid cursor file: {}", self.path.display()))?;
        Ok(Some(cursor))
    }

    /// Write the cursor via temp file + rename.
    pub async fn save(&self, cursor: &ReplicationCursor) -> Result<()> {
        let json = serde_json::to_vec_pretty(cursor)?;
        write_atomic(&self.path, &json).await
    }

    /// Read the embedded timestamps of `snapshot` and merge them into the
    /// stored cursor, keeping any other metadata already present.
    pub async fn refresh_from_snapshot(
        &self,
        tool: &dyn ExtractionTool,
        snapshot: &Path,
    ) -> Result<ReplicationCursor> {
        let cursor = self.merged_with_snapshot(tool, snapshot).await?;
        self.save(&cursor).await?;

        tracing::info!(
            first = %cursor.elements.first_timestamp,
            last = %cursor.elements.last_timestamp,
            path = %self.path.display(),
            "cursor refreshed from history file"
        );
        Ok(cursor)
    }

    /// The stored cursor with `elements` replaced by the snapshot's embedded
    /// timestamps. Nothing is written.
    pub async fn merged_with_snapshot(
        &self,
        tool: &dyn ExtractionTool,
        snapshot: &Path,
    ) -> Result<ReplicationCursor> {
        let timestamps = tool.timestamps(snapshot).await?;

        let mut raw = self.load_raw().await?.unwrap_or_default();
        let elements = CursorElements {
            first_timestamp: timestamps.first,
            last_timestamp: timestamps.last,
        };
        raw.insert("elements".to_string(), serde_json::to_value(&elements)?);

        Ok(serde_json::from_value(Value::Object(raw))?)
    }

    async fn load_raw(&self) -> Result<Option<Map<String, Value>>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read cursor file: {}", self.path.display()))?;
        match serde_json::from_slice::<Value>(&bytes)
            .with_context(|| format!("Cursor file is not JSON: {}", self.path.display()))?
        {
            Value::Object(map) => Ok(Some(map)),
            _ => bail!("Cursor file must hold a JSON object: {}", self.path.display()),
        }
    }
}

/// Describe the history file as the cursor sees it.
pub async fn describe_snapshot(
    path: &Path,
    cursor: &ReplicationCursor,
) -> Result<HistorySnapshot> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(HistorySnapshot {
        path: path.to_path_buf(),
        first_timestamp: cursor.elements.first_timestamp,
        last_timestamp: cursor.elements.last_timestamp,
        size_bytes: metadata.len(),
    })
}
