use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::SamplingSettings;

pub const EVENT_INGEST_LOAD_BEGIN: &str = "ingest.load.begin";
pub const EVENT_INGEST_LOAD_PROGRESS: &str = "ingest.load.progress";
pub const EVENT_INGEST_LOAD_END: &str = "ingest.load.end";
pub const EVENT_INGEST_COPY_BATCH: &str = "ingest.copy.batch";
pub const EVENT_BACKPRESSURE_ENTER: &str = "backpressure.enter";
pub const EVENT_BACKPRESSURE_EXIT: &str = "backpressure.exit";
pub const EVENT_INGEST_COPY_FAILED: &str = "ingest.copy.failed";
pub const EVENT_INGEST_PATH_RESOLVE: &str = "ingest.path.resolve";
pub const EVENT_INGEST_ERROR_THRESHOLD: &str = "ingest.error.threshold";
pub const EVENT_ALIGN_MERGE_WINDOW: &str = "align.merge.window";
pub const EVENT_TASK_BEGIN: &str = "task.begin";
pub const EVENT_TASK_SUMMARY: &str = "task.summary";

/// Returns the configured sampling rate for `event_name`, clamped to
/// `[0.0, 1.0]`. Unknown events fall back to `default_rate`.
pub fn event_sampling_rate(sampling: &SamplingSettings, event_name: &str) -> f64 {
    let rate = sampling
        .high_frequency_events
        .get(event_name)
        .copied()
        .unwrap_or(sampling.default_rate);
    rate.clamp(0.0, 1.0)
}

/// Throttles high-frequency progress events by row count and wall-clock
/// interval, matching the `SamplingGate` the domain event stream relies on
/// to avoid flooding `app.ndjson` with per-row noise.
pub struct SamplingGate {
    every_n: u64,
    min_interval: std::time::Duration,
    last_emit: Option<Instant>,
}

impl SamplingGate {
    pub fn new(every_n: u64, min_interval_secs: f64) -> Self {
        Self {
            every_n: every_n.max(1),
            min_interval: std::time::Duration::from_secs_f64(min_interval_secs.max(0.0)),
            last_emit: None,
        }
    }

    pub fn allow(&mut self, index: u64) -> bool {
        let now = Instant::now();
        let due_by_interval = match self.last_emit {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        };
        if index % self.every_n == 0 && due_by_interval {
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}

/// A JSON-lines event writer with a fixed field order:
/// `timestamp, level, logger, event, message, <extra fields...>`.
/// Field order is enforced with `serde_json`'s `preserve_order` feature
/// rather than relying on struct declaration order, since the extra
/// fields are an open map whose keys vary per call site.
pub struct EventLog<W: std::io::Write> {
    writer: W,
    logger: String,
}

impl<W: std::io::Write> EventLog<W> {
    pub fn new(writer: W, logger: impl Into<String>) -> Self {
        Self { writer, logger: logger.into() }
    }

    pub fn info(&mut self, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        self.emit("INFO", event, message, fields);
    }

    pub fn error(&mut self, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        self.emit("ERROR", event, message, fields);
    }

    fn emit(&mut self, level: &str, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        let mut map = Map::new();
        map.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        map.insert("level".into(), Value::String(level.into()));
        map.insert("logger".into(), Value::String(self.logger.clone()));
        map.insert("event".into(), Value::String(event.into()));
        map.insert("message".into(), Value::String(message.into()));
        for (key, value) in fields {
            map.insert(key.into(), value);
        }
        let line = Value::Object(map).to_string();
        let _ = writeln!(self.writer, "{line}");
    }
}

/// The four on-disk sinks one run writes: `app.ndjson` gets everything,
/// `error.ndjson` gets error-level events, `sql.ndjson` gets merge/SQL
/// events, and `perf.ndjson` gets the throughput-sensitive ingest events
/// that `summarize_perf_log` later aggregates into percentiles.
pub struct RunEventLog {
    app: EventLog<File>,
    error: EventLog<File>,
    sql: EventLog<File>,
    perf: EventLog<File>,
}

impl RunEventLog {
    pub fn create(run_dir: &Path, logger: impl Into<String>) -> std::io::Result<Self> {
        let logger = logger.into();
        let open = |name: &str| -> std::io::Result<EventLog<File>> {
            Ok(EventLog::new(File::create(run_dir.join(name))?, logger.clone()))
        };
        Ok(Self { app: open("app.ndjson")?, error: open("error.ndjson")?, sql: open("sql.ndjson")?, perf: open("perf.ndjson")? })
    }

    pub fn info(&mut self, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        if matches!(event, EVENT_INGEST_COPY_BATCH | EVENT_BACKPRESSURE_ENTER | EVENT_BACKPRESSURE_EXIT) {
            self.perf.info(event, message, fields.clone());
        }
        self.app.info(event, message, fields);
    }

    pub fn error(&mut self, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        self.error.error(event, message, fields.clone());
        self.app.error(event, message, fields);
    }

    /// Routes a merge/alignment event to `sql.ndjson` in addition to `app.ndjson`.
    pub fn sql(&mut self, event: &str, message: &str, fields: Vec<(&str, Value)>) {
        self.sql.info(event, message, fields.clone());
        self.app.info(event, message, fields);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlStat {
    pub sql: String,
    pub cost_ms: f64,
    pub affected_rows: u64,
}

/// Accumulates the throughput/failure/backpressure counters that feed
/// `summary.json` and the `task.summary` event at the end of a run.
#[derive(Debug, Clone)]
pub struct RunDiagnostics {
    pub rows_total: u64,
    pub rows_merged: u64,
    pub failures: u64,
    pub backpressure_count: u64,
    pub slow_sql_top: Vec<SqlStat>,
    pub extra: BTreeMap<String, Value>,
    started_at: std::time::SystemTime,
}

impl Default for RunDiagnostics {
    fn default() -> Self {
        Self {
            rows_total: 0,
            rows_merged: 0,
            failures: 0,
            backpressure_count: 0,
            slow_sql_top: Vec::new(),
            extra: BTreeMap::new(),
            started_at: SystemTime::now(),
        }
    }
}

impl RunDiagnostics {
    pub fn as_value(&self) -> Value {
        let elapsed_ms = self
            .started_at
            .elapsed()
            .unwrap_or_default()
            .as_millis()
            .max(1) as u64;
        let rows_per_sec = self.rows_merged as f64 / (elapsed_ms as f64 / 1000.0);

        let slow_top: Vec<Value> = self
            .slow_sql_top
            .iter()
            .map(|s| {
                serde_json::json!({
                    "sql": s.sql.chars().take(200).collect::<String>(),
                    "cost_ms": s.cost_ms,
                    "affected_rows": s.affected_rows,
                })
            })
            .collect();

        let mut out = Map::new();
        out.insert("rows_total".into(), self.rows_total.into());
        out.insert("rows_merged".into(), self.rows_merged.into());
        out.insert("failures".into(), self.failures.into());
        out.insert("backpressure_count".into(), self.backpressure_count.into());
        out.insert("duration_ms".into(), elapsed_ms.into());
        out.insert("rows_per_sec".into(), rows_per_sec.into());
        out.insert("slow_sql_top".into(), Value::Array(slow_top));
        if !self.extra.is_empty() {
            out.insert(
                "diagnostics".into(),
                Value::Object(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            );
        }
        Value::Object(out)
    }
}

/// An opaque monotonic-ish run identifier used as the default `batch=`
/// token when no explicit run id is supplied. Wall-clock based, so not
/// guaranteed unique under clock skew across hosts — good enough for a
/// single-box batch job, same guarantee the original provides.
pub fn generate_run_id() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    chrono::DateTime::<Utc>::from_timestamp(now.as_secs() as i64, 0)
        .unwrap_or_default()
        .format("%Y%m%dT%H%M%SZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_gate_allows_on_multiples_and_interval() {
        let mut gate = SamplingGate::new(10, 0.0);
        assert!(gate.allow(0));
        assert!(!gate.allow(5));
        assert!(gate.allow(10));
    }

    #[test]
    fn sampling_gate_blocks_within_min_interval() {
        let mut gate = SamplingGate::new(1, 10.0);
        assert!(gate.allow(0));
        assert!(!gate.allow(1));
    }

    #[test]
    fn event_sampling_rate_clamps_out_of_range_values() {
        let mut sampling = SamplingSettings::default();
        sampling.high_frequency_events.insert("weird".into(), 5.0);
        assert_eq!(event_sampling_rate(&sampling, "weird"), 1.0);
    }

    #[test]
    fn event_log_preserves_field_order() {
        let mut buf = Vec::new();
        {
            let mut log = EventLog::new(&mut buf, "pumpflow");
            log.info(EVENT_INGEST_LOAD_BEGIN, "starting file load", vec![("file_path", "a.csv".into())]);
        }
        let line = String::from_utf8(buf).unwrap();
        let ts_pos = line.find("\"timestamp\"").unwrap();
        let level_pos = line.find("\"level\"").unwrap();
        let event_pos = line.find("\"event\"").unwrap();
        let message_pos = line.find("\"message\"").unwrap();
        assert!(ts_pos < level_pos);
        assert!(level_pos < event_pos);
        assert!(event_pos < message_pos);
    }

    #[test]
    fn run_event_log_routes_to_the_right_sinks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = RunEventLog::create(dir.path(), "pumpflow").unwrap();
            log.info(EVENT_INGEST_COPY_BATCH, "batch", vec![("batch_cost_ms", 5.into())]);
            log.error("ingest.copy.failed", "boom", vec![]);
            log.sql(EVENT_ALIGN_MERGE_WINDOW, "merged", vec![]);
        }
        let app = std::fs::read_to_string(dir.path().join("app.ndjson")).unwrap();
        let error = std::fs::read_to_string(dir.path().join("error.ndjson")).unwrap();
        let sql = std::fs::read_to_string(dir.path().join("sql.ndjson")).unwrap();
        let perf = std::fs::read_to_string(dir.path().join("perf.ndjson")).unwrap();

        assert_eq!(app.lines().count(), 3);
        assert_eq!(error.lines().count(), 1);
        assert_eq!(sql.lines().count(), 1);
        assert_eq!(perf.lines().count(), 1);
        assert!(perf.contains("batch_cost_ms"));
    }

    #[test]
    fn run_diagnostics_computes_rows_per_sec() {
        let mut diag = RunDiagnostics::default();
        diag.rows_merged = 100;
        let value = diag.as_value();
        assert!(value["rows_per_sec"].as_f64().unwrap() >= 0.0);
    }
}
