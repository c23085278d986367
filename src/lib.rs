//! # OSM for Cities
//!
//! Keeps a filtered OpenStreetMap full-history file current with the daily
//! replication diffs, and publishes, day by day, per-municipality GeoJSON
//! datasets into a git repository whose commit history is the data history.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ planet.osm   │──▶│  Snapshot    │──▶│  history     │
//! │ day diffs    │   │  updater     │   │  .osh.pbf    │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ time-filter
//!                                              ▼
//!        ┌─────────┐   ┌─────────┐   ┌──────────────────┐
//!        │ states  │──▶│ micro-  │──▶│ municipalities   │
//!        │ (lvl 1) │   │ regions │   │ (lvl 3)          │
//!        └─────────┘   └─────────┘   └────────┬─────────┘
//!                                             ▼
//!                        ┌──────────────┐   ┌──────────┐
//!                        │  datasets    │──▶│ git +    │
//!                        │  (GeoJSON)   │   │ stats    │
//!                        └──────────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Fatal error taxonomy |
//! | [`sequence`] | Day ↔ replication sequence number mapping |
//! | [`cursor`] | Replication cursor persistence |
//! | [`osmium`] | osmium subprocess wrapper |
//! | [`fetch`] | Daily diff download |
//! | [`snapshot`] | Atomic diff application |
//! | [`workdir`] | Per-run scratch directories |
//! | [`fanout`] | Bounded concurrent work units |
//! | [`split`] | Three-level region split with pruning |
//! | [`datasets`] | Per-municipality GeoJSON extraction |
//! | [`reference`] | Municipality and dataset reference data |
//! | [`stats`] | Run metrics and status report |
//! | [`commit`] | Daily git commits |
//! | [`storage`] | S3 persistence of the history file |
//! | [`pipeline`] | Replication and extraction loops |

pub mod commit;
pub mod config;
pub mod cursor;
pub mod datasets;
pub mod error;
pub mod fanout;
pub mod fetch;
pub mod models;
pub mod osmium;
pub mod pipeline;
pub mod reference;
pub mod sequence;
pub mod snapshot;
pub mod split;
pub mod stats;
pub mod storage;
pub mod workdir;
