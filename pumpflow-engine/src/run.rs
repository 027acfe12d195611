use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use diesel::PgConnection;
use miette::Diagnostic;
use pumpflow_db::merge::{count_tz_fallback, staging_time_range};
use pumpflow_db::pool::ConnectionPool;
use pumpflow_db::quality::summarize_perf_log;
use pumpflow_db::{dims, merge, partition, staging};
use pumpflow_support::config::Settings;
use pumpflow_support::event_log::{
    RunDiagnostics, RunEventLog, EVENT_ALIGN_MERGE_WINDOW, EVENT_TASK_BEGIN, EVENT_TASK_SUMMARY,
};
use pumpflow_support::types::{CopyStats, MergeStats};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::copy_loader::copy_from_mapping;
use crate::mapping::{flatten, load_mapping, MappingError};
use crate::window::split_window;

#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Dimension(#[from] dims::DimensionError),

    #[error("database error")]
    Db(#[source] diesel::result::Error),

    #[error("connection pool error")]
    Pool(#[source] pumpflow_db::pool::PoolError),

    #[error(transparent)]
    Partition(#[from] partition::PartitionError),

    #[error(transparent)]
    Merge(#[from] merge::MergeError),

    #[error("failed to write run artifact at {path}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<diesel::result::Error> for RunError {
    fn from(value: diesel::result::Error) -> Self {
        RunError::Db(value)
    }
}

pub struct RunRequest {
    pub mapping_path: PathBuf,
    pub base_dir: PathBuf,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub use_staging_time_range: bool,
    pub run_dir: PathBuf,
    pub run_id: String,
    pub write_summary_json: bool,
    pub reset_staging: bool,
}

/// Runs the whole pipeline: dims → staging → copy → (optional auto window
/// detection) → merge → summary. Mirrors the five-phase sequencing of the
/// orchestrator this is grounded on, including the env.json merge-not-
/// overwrite rule (an existing `config_snapshot` key is kept rather than
/// clobbered) and writing `summary.json` only when requested.
pub async fn run_all(
    settings: &Settings,
    pool: Arc<ConnectionPool>,
    request: RunRequest,
) -> Result<Value, RunError> {
    std::fs::create_dir_all(&request.run_dir).map_err(|source| RunError::Artifact {
        path: request.run_dir.display().to_string(),
        source,
    })?;

    let event_log = Arc::new(Mutex::new(RunEventLog::create(&request.run_dir, "pumpflow").map_err(|source| {
        RunError::Artifact { path: request.run_dir.display().to_string(), source }
    })?));

    write_env_json(&request, settings)?;

    {
        let mut log = event_log.lock().expect("event log mutex poisoned");
        log.info(
            EVENT_TASK_BEGIN,
            "run started",
            vec![
                ("run_id", request.run_id.clone().into()),
                ("mapping_file", request.mapping_path.display().to_string().into()),
                ("window_start", request.window_start.to_rfc3339().into()),
                ("window_end", request.window_end.to_rfc3339().into()),
            ],
        );
    }

    let mut diagnostics = RunDiagnostics::default();

    let mapping = load_mapping(&request.mapping_path)?;
    {
        let mut conn = pool.acquire().map_err(RunError::Pool)?;
        prepare_dim(&mut conn, &mapping, std::path::Path::new(&settings.system.metric_catalog_path))?;
        staging::create_staging_if_not_exists(&mut conn)?;
        if request.reset_staging {
            staging::truncate_staging(&mut conn)?;
        }
    }

    let entries = flatten(&mapping);
    let copy_stats: CopyStats = copy_from_mapping(
        Arc::clone(&pool),
        request.base_dir.clone(),
        entries,
        request.run_id.clone(),
        settings.ingest.clone(),
        Arc::clone(&event_log),
    )
    .await;
    diagnostics.rows_total = copy_stats.rows_read;
    diagnostics.failures = copy_stats.files_failed;
    diagnostics.backpressure_count = copy_stats.backpressure_events;

    let (window_start, window_end) = if request.use_staging_time_range {
        let mut conn = pool.acquire().map_err(RunError::Pool)?;
        match staging_time_range(&mut conn, &settings.merge.tz.default_station_tz)? {
            Some((min_ts, max_ts, _count)) => (min_ts, max_ts),
            None => (request.window_start, request.window_end),
        }
    } else {
        (request.window_start, request.window_end)
    };

    let granularity = crate::window::parse_granularity(&settings.merge.segmented.granularity);
    let segments = if settings.merge.segmented.enabled {
        split_window(window_start, window_end, granularity)
    } else {
        vec![(window_start, window_end)]
    };

    let mut merged = MergeStats::default();
    {
        let mut conn = pool.acquire().map_err(RunError::Pool)?;
        for (seg_start, seg_end) in segments {
            let stats = merge::merge_window(
                &mut conn,
                seg_start,
                seg_end,
                &settings.merge.tz.default_station_tz,
                settings.merge.tz.allow_missing_tz,
            )?;
            let mut log = event_log.lock().expect("event log mutex poisoned");
            log.sql(
                EVENT_ALIGN_MERGE_WINDOW,
                "merge window committed",
                vec![
                    ("window_start", seg_start.to_rfc3339().into()),
                    ("window_end", seg_end.to_rfc3339().into()),
                    ("rows_merged", stats.rows_merged.into()),
                    ("rows_deduped", stats.rows_deduped.into()),
                    ("sql_cost_ms", stats.sql_cost_ms.into()),
                ],
            );
            merged.rows_in += stats.rows_in;
            merged.rows_deduped += stats.rows_deduped;
            merged.rows_merged += stats.rows_merged;
            merged.sql_cost_ms += stats.sql_cost_ms;
            merged.affected_rows += stats.affected_rows;
        }
        merged.dedup_ratio = merged.rows_deduped as f64 / merged.rows_in.max(1) as f64;

        diagnostics.rows_merged = merged.rows_merged;
        diagnostics.extra.insert(
            "tz_fallback_count".into(),
            count_tz_fallback(&mut conn, window_start, window_end, &settings.merge.tz.default_station_tz)?.into(),
        );
    }

    let perf_summary = summarize_perf_log(&request.run_dir);
    diagnostics.extra.insert("batches".into(), perf_summary.batches.into());
    diagnostics.extra.insert("batch_cost_ms_p50".into(), perf_summary.batch_cost_ms_p50.into());
    diagnostics.extra.insert("batch_cost_ms_p90".into(), perf_summary.batch_cost_ms_p90.into());
    diagnostics.extra.insert("batch_cost_ms_p95".into(), perf_summary.batch_cost_ms_p95.into());
    diagnostics.extra.insert("batch_cost_ms_p99".into(), perf_summary.batch_cost_ms_p99.into());
    diagnostics.extra.insert("batch_cost_ms_max".into(), perf_summary.batch_cost_ms_max.into());
    diagnostics.extra.insert("batch_cost_ms_min".into(), perf_summary.batch_cost_ms_min.into());
    diagnostics.extra.insert("rows_per_sec_p95".into(), perf_summary.rows_per_sec_p95.into());
    diagnostics.extra.insert("fail_rate_avg".into(), perf_summary.fail_rate_avg.into());
    diagnostics.extra.insert("fail_rate_p95".into(), perf_summary.fail_rate_p95.into());
    diagnostics.extra.insert("fail_rate_max".into(), perf_summary.fail_rate_max.into());

    let summary_value = serde_json::json!({
        "run_id": request.run_id,
        "window": {
            "start": window_start.to_rfc3339(),
            "end": window_end.to_rfc3339(),
        },
        "copy_stats": copy_stats,
        "merge_stats": merged,
        "diagnostics": diagnostics.as_value(),
    });

    if request.write_summary_json {
        let summary_path = request.run_dir.join("summary.json");
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary_value).unwrap_or_default()).map_err(
            |source| RunError::Artifact { path: summary_path.display().to_string(), source },
        )?;
    }

    {
        let mut log = event_log.lock().expect("event log mutex poisoned");
        log.info(
            EVENT_TASK_SUMMARY,
            "run finished",
            vec![
                ("rows_valid", copy_stats.rows_valid.into()),
                ("rows_rejected", copy_stats.rows_rejected.into()),
                ("rows_merged", merged.rows_merged.into()),
            ],
        );
    }

    Ok(summary_value)
}

fn prepare_dim(conn: &mut PgConnection, mapping: &crate::mapping::MappingFile, catalog_sql_path: &Path) -> Result<(), RunError> {
    dims::ensure_sequences(conn)?;
    for station in &mapping.stations {
        let station_id = dims::upsert_station(conn, &station.name)?;
        for device in &station.devices {
            let device_type = dims::normalize_device_type(device.device_type.as_deref());
            let pump_type = dims::normalize_pump_type(device_type, device.pump_type.as_deref());
            dims::upsert_device(conn, station_id, &device.name, device_type, pump_type)?;
        }
    }
    dims::reload_metric_catalog(conn, catalog_sql_path)?;
    Ok(())
}

/// Writes `env.json`, merging onto any keys a prior invocation already
/// placed there (e.g. `config_snapshot` from the CLI layer) rather than
/// overwriting the whole file.
fn write_env_json(request: &RunRequest, settings: &Settings) -> Result<(), RunError> {
    let path = request.run_dir.join("env.json");
    let mut merged: serde_json::Map<String, Value> = if path.exists() {
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        serde_json::Map::new()
    };

    merged.entry("config_snapshot".to_string()).or_insert_with(|| serde_json::to_value(settings).unwrap_or(Value::Null));
    merged.entry("config_summary".to_string()).or_insert_with(|| {
        serde_json::to_value(pumpflow_support::config::ingest_config_summary()).unwrap_or(Value::Null)
    });
    merged.insert("run_id".into(), request.run_id.clone().into());
    merged.insert("run_dir".into(), request.run_dir.display().to_string().into());

    std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(merged)).unwrap_or_default()).map_err(
        |source| RunError::Artifact { path: path.display().to_string(), source },
    )
}

/// Computes the default run directory, `logs/runs/<timestamp>`, matching
/// the original's `compute_run_dir`.
pub fn compute_run_dir(logs_dir: &Path, run_id: &str) -> PathBuf {
    logs_dir.join("runs").join(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_run_dir_nests_under_logs_runs() {
        let dir = compute_run_dir(Path::new("logs"), "20250228T100000Z");
        assert_eq!(dir, PathBuf::from("logs/runs/20250228T100000Z"));
    }
}
