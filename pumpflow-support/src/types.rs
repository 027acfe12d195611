use serde::{Deserialize, Serialize};

/// A CSV row that parsed cleanly against the staging contract.
///
/// `data_time`/`data_value` are kept as normalized *text*, not parsed
/// numeric/temporal types: the merge executor is the only place that
/// interprets `data_time` against a station's timezone (`AT TIME ZONE`),
/// and `data_value` is cast with `::numeric` in SQL. Parsing either one
/// here would bake in a premature (and likely wrong) UTC assumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidRow {
    pub tag_name: String,
    pub data_time: String,
    pub data_value: String,
    pub source_hint: String,
}

/// A CSV row that failed validation, paired with why. `station_name`/
/// `device_name`/`metric_key` are filled in by the COPY loader (the CSV
/// reader only knows the raw cell text), so a reject carries the same
/// natural keys a valid row would have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectRow {
    pub station_name: Option<String>,
    pub device_name: Option<String>,
    pub metric_key: Option<String>,
    pub raw_tag_name: Option<String>,
    pub raw_data_time: Option<String>,
    pub raw_data_value: Option<String>,
    pub reason: String,
    pub source_hint: String,
}

/// Either outcome of parsing one CSV line. A sum type rather than a
/// best-effort struct with optional fields, per the row-level redesign
/// guidance: callers must branch on an outcome, not infer validity from
/// which fields happen to be populated.
#[derive(Debug, Clone, PartialEq)]
pub enum CsvRow {
    Valid(ValidRow),
    Reject(RejectRow),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyStats {
    pub rows_read: u64,
    pub rows_valid: u64,
    pub rows_rejected: u64,
    pub bytes_read: u64,
    pub cost_ms: u64,
    pub files_total: u64,
    pub files_succeeded: u64,
    pub files_failed: u64,
    pub backpressure_events: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub rows_in: u64,
    pub rows_deduped: u64,
    pub rows_merged: u64,
    pub dedup_ratio: f64,
    pub sql_cost_ms: u64,
    pub affected_rows: u64,
}
