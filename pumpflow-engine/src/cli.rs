use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

/// Industrial time-series batch ingestion and alignment engine.
#[derive(Debug, Parser)]
#[command(name = "pumpflow-engine", version)]
pub struct Cli {
    /// Config directory override (defaults to `./configs`, then `./config`).
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upserts station/device dimensions from a mapping file.
    PrepareDim {
        mapping: PathBuf,
    },

    /// Idempotently creates the staging tables.
    CreateStaging,

    /// Loads every file named in a mapping into staging.
    IngestCopy {
        mapping: PathBuf,
    },

    /// Merges staged rows into the partitioned fact table for one window.
    MergeFact {
        #[arg(long)]
        window_start: DateTime<Utc>,
        #[arg(long)]
        window_end: DateTime<Utc>,
    },

    /// Read-only mapping-file + on-disk path consistency report.
    CheckMapping {
        mapping: PathBuf,
    },

    /// Coverage/gap/outlier data-quality report over one window.
    DataReport {
        #[arg(long)]
        window_start: DateTime<Utc>,
        #[arg(long)]
        window_end: DateTime<Utc>,
        #[arg(long, default_value_t = 300)]
        expected_interval: i64,
        #[arg(long, default_value_t = 20)]
        top_k: i64,
        #[arg(long, default_value = "metric")]
        group_by: String,
    },

    /// Runs the whole pipeline end to end.
    RunAll {
        #[arg(long, default_value = "mapping.json")]
        mapping: PathBuf,
        #[arg(long)]
        use_staging_time_range: bool,
        #[arg(long)]
        window_start: Option<DateTime<Utc>>,
        #[arg(long)]
        window_end: Option<DateTime<Utc>>,
        #[arg(long)]
        summary_json: Option<PathBuf>,
        /// Truncates staging before loading. The source sometimes truncates
        /// and sometimes doesn't with no consistent rule; here it's always
        /// an explicit operator choice.
        #[arg(long)]
        reset_staging: bool,
    },

    /// Truncates staging and fact tables. Destructive; requires confirmation
    /// via the same operator workflow as the system this is grounded on.
    AdminClearDb,

    /// Checks database connectivity with `SELECT 1`.
    DbPing {
        #[arg(long)]
        verbose: bool,
    },
}
