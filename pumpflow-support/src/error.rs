use miette::Diagnostic;
use thiserror::Error;

/// Top-level error taxonomy shared across the ingest pipeline. `pumpflow-db`
/// defines its own `PoolError`; it is boxed here rather than named directly
/// so this crate never needs a diesel/r2d2 dependency of its own.
#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid configuration")]
    Config(#[source] figment::Error),

    #[error("connection pool error")]
    Pool(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("database operation timed out after {elapsed_ms}ms")]
    DbTimeout { elapsed_ms: u64 },

    #[error("CSV header invalid: missing {missing:?}")]
    Header { missing: Vec<String> },

    #[error("merge failed for window [{window_start}, {window_end})")]
    Merge {
        window_start: String,
        window_end: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("fatal: {0}")]
    Fatal(String),
}
