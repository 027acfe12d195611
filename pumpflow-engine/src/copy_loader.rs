use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use miette::Diagnostic;
use pumpflow_db::copy::{copy_valid_rows, insert_rejects};
use pumpflow_db::pool::ConnectionPool;
use pumpflow_support::config::IngestConfig;
use pumpflow_support::event_log::{
    RunEventLog, SamplingGate, EVENT_BACKPRESSURE_ENTER, EVENT_BACKPRESSURE_EXIT, EVENT_INGEST_COPY_BATCH,
    EVENT_INGEST_COPY_FAILED, EVENT_INGEST_ERROR_THRESHOLD, EVENT_INGEST_LOAD_BEGIN, EVENT_INGEST_LOAD_END,
    EVENT_INGEST_LOAD_PROGRESS,
};
use pumpflow_support::source_hint::make_source_hint;
use pumpflow_support::types::{CopyStats, CsvRow, RejectRow, ValidRow};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::backpressure::{Action, BackpressureController};
use crate::csv_reader::{CsvReader, OpenError};
use crate::mapping::MappingEntry;

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("failed to open {path}")]
    Open {
        path: String,
        #[source]
        source: OpenError,
    },

    #[error("database error loading {path}")]
    Db {
        path: String,
        #[source]
        source: diesel::result::Error,
    },

    #[error("pool error loading {path}")]
    Pool {
        path: String,
        #[source]
        source: pumpflow_db::pool::PoolError,
    },

    #[error("{path} exceeded its error threshold ({rejected}/{seen} rows rejected)")]
    ErrorThresholdExceeded { path: String, rejected: u64, seen: u64 },
}

/// Rolling window of the last `K` batch costs, used to compute the P95 that
/// feeds [`BackpressureController::decide`] after every batch.
struct RollingP95 {
    window: std::collections::VecDeque<u64>,
    capacity: usize,
}

impl RollingP95 {
    fn new(capacity: usize) -> Self {
        Self { window: std::collections::VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    fn push(&mut self, cost_ms: u64) -> u64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(cost_ms);
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * 0.95).floor() as usize).saturating_sub(1).min(sorted.len() - 1);
        sorted[idx]
    }
}

/// Loads one mapped file into staging: reads rows, batches them at
/// `settings.batch.size` (falling back to `settings.commit_interval` when
/// `0`), COPYs valid rows and inserts rejects, and feeds batch cost/fail
/// rate into a [`BackpressureController`] that can shrink the batch size
/// or worker count mid-file. Exceeding `max_errors_per_file` or
/// `error_threshold_percent` always fails this file; `continue_on_error`
/// only decides, in [`copy_from_mapping`], whether later files still run.
fn load_one_file(
    pool: &ConnectionPool,
    base_dir: &Path,
    entry: &MappingEntry,
    run_id: &str,
    settings: &IngestConfig,
    event_log: &Mutex<RunEventLog>,
    progress_gate: &Mutex<SamplingGate>,
) -> Result<CopyStats, LoadError> {
    let path = PathBuf::from(&entry.file);
    let full_path = base_dir.join(&path);
    let source_hint = make_source_hint(settings.enhanced_source_hint, base_dir, &full_path, Some(run_id));

    let mut reader = CsvReader::open(&full_path, source_hint, &settings.csv).map_err(|source| LoadError::Open {
        path: entry.file.clone(),
        source,
    })?;

    {
        let mut log = event_log.lock().expect("event log mutex poisoned");
        log.info(
            EVENT_INGEST_LOAD_BEGIN,
            "starting file load",
            vec![
                ("file_path", entry.file.clone().into()),
                ("station", entry.station.clone().into()),
                ("device", entry.device.clone().into()),
                ("metric_key", entry.metric_key.clone().into()),
            ],
        );
    }

    let batch_target = if settings.batch.size > 0 { settings.batch.size } else { settings.commit_interval as usize };
    let mut backpressure = BackpressureController::new(
        batch_target.max(1),
        settings.workers.max(settings.backpressure_thresholds.min_workers),
        settings.backpressure_thresholds.clone(),
    );
    let mut p95_tracker = RollingP95::new(settings.p95_window);
    let mut in_backpressure = false;

    let mut stats = CopyStats::default();
    let mut batch_valid: Vec<ValidRow> = Vec::with_capacity(backpressure.batch_size());
    let mut batch_reject: Vec<RejectRow> = Vec::new();
    let mut batch_index: u64 = 0;

    let mut flush = |valid: &mut Vec<ValidRow>, reject: &mut Vec<RejectRow>, stats: &mut CopyStats| -> Result<(), LoadError> {
        if valid.is_empty() && reject.is_empty() {
            return Ok(());
        }
        let started = std::time::Instant::now();
        let mut conn = pool.acquire().map_err(|source| LoadError::Pool { path: entry.file.clone(), source })?;

        if !valid.is_empty() {
            copy_valid_rows(&mut conn, &entry.station, &entry.device, &entry.metric_key, valid)
                .map_err(|source| LoadError::Db { path: entry.file.clone(), source })?;
        }
        if !reject.is_empty() {
            insert_rejects(&mut conn, reject).map_err(|source| LoadError::Db { path: entry.file.clone(), source })?;
        }

        let cost_ms = started.elapsed().as_millis() as u64;
        let batch_rows = (valid.len() + reject.len()) as u64;
        let rows_per_sec = if cost_ms > 0 { batch_rows as f64 * 1000.0 / cost_ms as f64 } else { batch_rows as f64 };
        let fail_rate = if batch_rows > 0 { reject.len() as f64 / batch_rows as f64 } else { 0.0 };

        stats.rows_valid += valid.len() as u64;
        stats.rows_rejected += reject.len() as u64;
        stats.cost_ms += cost_ms;

        batch_index += 1;
        let p95_ms = p95_tracker.push(cost_ms);

        {
            let mut log = event_log.lock().expect("event log mutex poisoned");
            log.info(
                EVENT_INGEST_COPY_BATCH,
                "copy batch committed",
                vec![
                    ("file_path", entry.file.clone().into()),
                    ("batch_index", batch_index.into()),
                    ("rows", batch_rows.into()),
                    ("batch_cost_ms", cost_ms.into()),
                    ("rows_per_sec", rows_per_sec.into()),
                    ("fail_rate", fail_rate.into()),
                ],
            );
        }

        match backpressure.decide(p95_ms, fail_rate) {
            Action::ShrinkBatch { to_batch } => {
                if !in_backpressure {
                    in_backpressure = true;
                    stats.backpressure_events += 1;
                    let mut log = event_log.lock().expect("event log mutex poisoned");
                    log.info(EVENT_BACKPRESSURE_ENTER, "entering backpressure", vec![("to_batch", to_batch.into())]);
                }
            }
            Action::ShrinkWorkers { to_workers } => {
                if !in_backpressure {
                    in_backpressure = true;
                    stats.backpressure_events += 1;
                    let mut log = event_log.lock().expect("event log mutex poisoned");
                    log.info(
                        EVENT_BACKPRESSURE_ENTER,
                        "entering backpressure",
                        vec![("to_workers", to_workers.into())],
                    );
                }
            }
            Action::Recover => {
                if in_backpressure {
                    in_backpressure = false;
                    let mut log = event_log.lock().expect("event log mutex poisoned");
                    log.info(EVENT_BACKPRESSURE_EXIT, "backpressure lifted", vec![]);
                }
            }
            Action::None => {}
        }

        valid.clear();
        reject.clear();
        Ok(())
    };

    for row in reader.rows() {
        stats.rows_read += 1;
        match row {
            CsvRow::Valid(valid) => batch_valid.push(valid),
            CsvRow::Reject(mut reject) => {
                reject.station_name = Some(entry.station.clone());
                reject.device_name = Some(entry.device.clone());
                reject.metric_key = Some(entry.metric_key.clone());
                batch_reject.push(reject);
            }
        }

        let seen = stats.rows_valid + stats.rows_rejected + batch_valid.len() as u64 + batch_reject.len() as u64;
        if settings.error_handling.max_errors_per_file > 0
            && stats.rows_rejected + batch_reject.len() as u64 > settings.error_handling.max_errors_per_file
        {
            let mut log = event_log.lock().expect("event log mutex poisoned");
            log.error(
                EVENT_INGEST_ERROR_THRESHOLD,
                "max errors per file exceeded",
                vec![("file_path", entry.file.clone().into())],
            );
            return Err(LoadError::ErrorThresholdExceeded {
                path: entry.file.clone(),
                rejected: stats.rows_rejected + batch_reject.len() as u64,
                seen,
            });
        }

        if batch_valid.len() + batch_reject.len() >= backpressure.batch_size() {
            flush(&mut batch_valid, &mut batch_reject, &mut stats)?;

            let mut gate = progress_gate.lock().expect("progress gate mutex poisoned");
            if gate.allow(batch_index) {
                let mut log = event_log.lock().expect("event log mutex poisoned");
                log.info(
                    EVENT_INGEST_LOAD_PROGRESS,
                    "load progress",
                    vec![
                        ("file_path", entry.file.clone().into()),
                        ("rows_valid", stats.rows_valid.into()),
                        ("rows_rejected", stats.rows_rejected.into()),
                    ],
                );
            }
        }
    }
    flush(&mut batch_valid, &mut batch_reject, &mut stats)?;
    stats.bytes_read = std::fs::metadata(&full_path).map(|m| m.len()).unwrap_or(0);

    let total = stats.rows_valid + stats.rows_rejected;
    if total > 0 {
        let reject_pct = stats.rows_rejected as f64 / total as f64 * 100.0;
        if reject_pct > settings.error_handling.error_threshold_percent {
            let mut log = event_log.lock().expect("event log mutex poisoned");
            log.error(
                EVENT_INGEST_COPY_FAILED,
                "error threshold percent exceeded",
                vec![("file_path", entry.file.clone().into()), ("reject_pct", reject_pct.into())],
            );
            return Err(LoadError::ErrorThresholdExceeded {
                path: entry.file.clone(),
                rejected: stats.rows_rejected,
                seen: total,
            });
        }
    }

    {
        let mut log = event_log.lock().expect("event log mutex poisoned");
        log.info(
            EVENT_INGEST_LOAD_END,
            "finished file load",
            vec![
                ("file_path", entry.file.clone().into()),
                ("rows_valid", stats.rows_valid.into()),
                ("rows_rejected", stats.rows_rejected.into()),
                ("cost_ms", stats.cost_ms.into()),
            ],
        );
    }

    Ok(stats)
}

/// Loads every file named in the mapping, bounding in-flight files at
/// `settings.workers` via a semaphore. Each file runs on a blocking thread
/// since the underlying pool is synchronous diesel; the semaphore (not a
/// bounded channel of files) governs concurrency, since the full file list
/// is already known up front and there's no producer to bound against.
///
/// A single file's [`LoadError`] never aborts the run: it's logged to
/// `error.ndjson`, counted in `files_failed`, and — unless
/// `error_handling.continue_on_error` is `false` — the remaining files
/// still load. The caller always gets a [`CopyStats`] back, never an
/// `Err`, so `summary.json` is written regardless of per-file failures.
pub async fn copy_from_mapping(
    pool: Arc<ConnectionPool>,
    base_dir: PathBuf,
    entries: Vec<MappingEntry>,
    run_id: String,
    settings: IngestConfig,
    event_log: Arc<Mutex<RunEventLog>>,
) -> CopyStats {
    let semaphore = Arc::new(Semaphore::new(settings.workers.max(1)));
    let progress_gate = Arc::new(Mutex::new(SamplingGate::new(10, 1.0)));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(entries.len());
    for entry in entries {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let pool = Arc::clone(&pool);
        let base_dir = base_dir.clone();
        let run_id = run_id.clone();
        let settings = settings.clone();
        let event_log = Arc::clone(&event_log);
        let progress_gate = Arc::clone(&progress_gate);
        let stop = Arc::clone(&stop);
        let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore closed");

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = load_one_file(&pool, &base_dir, &entry, &run_id, &settings, &event_log, &progress_gate);
            if let Err(err) = &result {
                let mut log = event_log.lock().expect("event log mutex poisoned");
                log.error(EVENT_INGEST_COPY_FAILED, &err.to_string(), vec![("file_path", entry.file.clone().into())]);
                drop(log);
                if !settings.error_handling.continue_on_error {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            result
        });
        handles.push(handle);
    }

    let mut total = CopyStats::default();
    total.files_total = handles.len() as u64;
    for handle in handles {
        match handle.await {
            Ok(Ok(stats)) => {
                total.files_succeeded += 1;
                total.rows_read += stats.rows_read;
                total.rows_valid += stats.rows_valid;
                total.rows_rejected += stats.rows_rejected;
                total.bytes_read += stats.bytes_read;
                total.cost_ms += stats.cost_ms;
                total.backpressure_events += stats.backpressure_events;
            }
            Ok(Err(_)) => total.files_failed += 1,
            Err(_panicked) => total.files_failed += 1,
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_p95_matches_discrete_definition_over_window() {
        let mut tracker = RollingP95::new(5);
        let mut last = 0;
        for cost in [500, 900, 2500, 2700, 2800] {
            last = tracker.push(cost);
        }
        assert_eq!(last, 2700);
    }

    #[test]
    fn rolling_p95_evicts_oldest_once_capacity_exceeded() {
        let mut tracker = RollingP95::new(3);
        tracker.push(100);
        tracker.push(100);
        tracker.push(100);
        let last = tracker.push(10_000);
        assert_eq!(last, 10_000);
    }
}
