//! Pipeline error taxonomy.
//!
//! Fatal conditions are carried as [`PipelineError`] inside `anyhow::Error`
//! so callers can `downcast_ref` them. Soft stops (a diff not yet published)
//! and expected-empty results are not errors; they are variants of the
//! outcome enums in `fetch`, `pipeline`, and `datasets`.

use chrono::NaiveDate;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The base history snapshot is missing at run start.
    #[error("history file not found: {0}")]
    MissingSnapshot(PathBuf),

    /// An external tool invocation exited unsuccessfully.
    #[error("`{program} {args}` failed ({status}): {stderr}")]
    Subprocess {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },

    /// One or more units of a fan-out stage failed under the strict policy.
    #[error("{stage}: {failed} of {total} units failed; first failure: {first}")]
    StageFailed {
        stage: String,
        failed: usize,
        total: usize,
        first: String,
    },

    /// A day has no replication sequence number.
    #[error("day {day} predates the first daily changefile ({epoch})")]
    BeforeEpoch { day: NaiveDate, epoch: NaiveDate },

    /// The replication server answered with a status other than success or 404.
    #[error("download of {url} failed (HTTP {status})")]
    Download { url: String, status: u16 },
}
