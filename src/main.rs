//! # OSM for Cities CLI (`ofc`)
//!
//! ## Usage
//!
//! ```bash
//! ofc --config ./config/ofc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ofc update` | Apply the next daily diff to the history file |
//! | `ofc extract` | Publish datasets for days the history already covers |
//! | `ofc cursor show` | Print the replication cursor |
//! | `ofc cursor refresh` | Re-read the cursor from the history file |
//! | `ofc status` | History, cursor and recent run metrics |
//! | `ofc sequence <day>` | Sequence number and URL of a day's diff |
//!
//! ## Examples
//!
//! ```bash
//! # Catch up to today, publishing every day along the way
//! ofc update --recursive --extract
//!
//! # Same, seeding from and persisting to S3
//! ofc update --recursive --extract --s3
//!
//! # Debug logging
//! RUST_LOG=osm_for_cities=debug ofc extract
//! ```

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use osm_for_cities::config::{self, Config, ReplicationConfig};
use osm_for_cities::cursor::CursorStore;
use osm_for_cities::fetch::diff_url;
use osm_for_cities::pipeline::{Pipeline, RunOptions, RunSummary, StopReason};
use osm_for_cities::sequence::SequenceClock;
use osm_for_cities::stats;
use osm_for_cities::storage::S3Store;

#[derive(Parser)]
#[command(
    name = "ofc",
    about = "OSM for Cities: incremental OSM history replication and per-municipality datasets",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ofc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the next daily replication diff to the history file.
    ///
    /// Stops without error when the history is up to date or the next diff
    /// has not been published.
    Update {
        /// Continue day after day until caught up.
        #[arg(long)]
        recursive: bool,

        /// Split and publish datasets for every applied day.
        #[arg(long)]
        extract: bool,

        /// Pull history and cursor from S3 first; push them after each day.
        #[arg(long)]
        s3: bool,
    },

    /// Publish datasets for the day after the last recorded one.
    Extract {
        /// Continue until the replication cursor is reached.
        #[arg(long)]
        recursive: bool,
    },

    /// Inspect or rebuild the replication cursor.
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },

    /// Show history, cursor, and recent run metrics.
    Status,

    /// Print the sequence number and diff URL for a day (YYYY-MM-DD).
    Sequence { day: NaiveDate },
}

#[derive(Subcommand)]
enum CursorAction {
    /// Print the cursor JSON.
    Show,
    /// Re-read first/last timestamps from the history file.
    Refresh,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("osm_for_cities=info".parse()?),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Needs only the replication settings, which all have defaults when no
    // config file exists. A config that exists must still parse.
    if let Commands::Sequence { day } = &cli.command {
        let replication = if cli.config.exists() {
            config::load_config(&cli.config)?.replication
        } else {
            ReplicationConfig::default()
        };
        let clock = SequenceClock::new(replication.epoch);
        let sequence = clock.sequence_for_day(*day)?;
        println!("{}  {}", sequence, diff_url(&replication.base_url, sequence));
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Update {
            recursive,
            extract,
            s3,
        } => {
            let pipeline = build_pipeline(&cfg, s3)?;
            let summary = pipeline
                .run_update(RunOptions {
                    recursive,
                    extract,
                    s3,
                })
                .await?;
            print_summary(&summary);
        }
        Commands::Extract { recursive } => {
            let pipeline = build_pipeline(&cfg, false)?;
            let summary = pipeline.run_extract(recursive).await?;
            print_summary(&summary);
        }
        Commands::Cursor { action } => match action {
            CursorAction::Show => {
                let store = CursorStore::new(cfg.paths.cursor_path());
                match store.load().await? {
                    Some(cursor) => println!("{}", serde_json::to_string_pretty(&cursor)?),
                    None => println!("No cursor at {}", store.path().display()),
                }
            }
            CursorAction::Refresh => {
                let pipeline = build_pipeline(&cfg, false)?;
                let cursor = pipeline.refresh_cursor().await?;
                println!(
                    "Cursor refreshed: {} to {}",
                    cursor.elements.first_timestamp, cursor.elements.last_timestamp
                );
            }
        },
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Sequence { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

fn build_pipeline(cfg: &Config, s3: bool) -> anyhow::Result<Pipeline> {
    let mut pipeline = Pipeline::from_config(cfg.clone())?;
    if s3 {
        let s3_config = cfg
            .s3
            .clone()
            .context("--s3 requires an [s3] section in the config")?;
        pipeline = pipeline.with_object_store(Arc::new(S3Store::from_env(s3_config)?));
    }
    Ok(pipeline)
}

fn print_summary(summary: &RunSummary) {
    match summary.days.as_slice() {
        [] => println!("No days processed."),
        [day] => println!("Processed {}.", day),
        [first, .., last] => println!(
            "Processed {} days ({} to {}).",
            summary.days.len(),
            first,
            last
        ),
    }
    match &summary.stop {
        StopReason::UpToDate { last_day } => println!("Up to date (last day {}).", last_day),
        StopReason::NotYetPublished { day, sequence } => {
            println!("Diff {} for {} is not published yet.", sequence, day)
        }
        StopReason::PossibleGap { day, sequence } => println!(
            "Diff {} for {} is missing; the replication feed may have a gap.",
            sequence, day
        ),
        StopReason::SingleStep => {}
    }
}
