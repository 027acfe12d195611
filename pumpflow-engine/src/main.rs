mod backpressure;
mod cli;
mod copy_loader;
mod csv_reader;
mod mapping;
mod run;
mod window;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use diesel::prelude::*;
use pumpflow_db::pool::ConnectionPool;
use pumpflow_db::quality::{generate_quality_report, GroupBy, QualityReportParams};
use pumpflow_db::{dims, merge, staging};
use pumpflow_support::config::{load_settings, Settings};

use cli::{Cli, Command};
use run::{compute_run_dir, run_all, RunRequest};

const EXIT_OK: u8 = 0;
const EXIT_IO_ERROR: u8 = 1;
const EXIT_DB_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> ExitCode {
    let settings = match load_settings(cli.config_dir.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    match cli.command {
        Command::PrepareDim { mapping } => prepare_dim_cmd(&settings, &mapping).await,
        Command::CreateStaging => create_staging_cmd(&settings).await,
        Command::IngestCopy { mapping } => ingest_copy_cmd(&settings, &mapping).await,
        Command::MergeFact { window_start, window_end } => merge_fact_cmd(&settings, window_start, window_end).await,
        Command::CheckMapping { mapping } => check_mapping_cmd(&mapping).await,
        Command::DataReport { window_start, window_end, expected_interval, top_k, group_by } => {
            data_report_cmd(&settings, window_start, window_end, expected_interval, top_k, &group_by).await
        }
        Command::RunAll { mapping, use_staging_time_range, window_start, window_end, summary_json, reset_staging } => {
            run_all_cmd(&settings, mapping, use_staging_time_range, window_start, window_end, summary_json, reset_staging)
                .await
        }
        Command::AdminClearDb => admin_clear_db_cmd(&settings).await,
        Command::DbPing { verbose } => db_ping_cmd(&settings, verbose).await,
    }
}

fn open_pool(settings: &Settings) -> Result<Arc<ConnectionPool>, ExitCode> {
    ConnectionPool::new(&settings.db).map(Arc::new).map_err(|err| {
        eprintln!("failed to connect to database: {err}");
        ExitCode::from(EXIT_DB_ERROR)
    })
}

async fn prepare_dim_cmd(settings: &Settings, mapping_path: &std::path::Path) -> ExitCode {
    let mapping = match mapping::load_mapping(mapping_path) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };

    let result: Result<(), dims::DimensionError> = (|| {
        dims::ensure_sequences(&mut conn)?;
        for station in &mapping.stations {
            let station_id = dims::upsert_station(&mut conn, &station.name)?;
            for device in &station.devices {
                let device_type = dims::normalize_device_type(device.device_type.as_deref());
                let pump_type = dims::normalize_pump_type(device_type, device.pump_type.as_deref());
                dims::upsert_device(&mut conn, station_id, &device.name, device_type, pump_type)?;
            }
        }
        dims::reload_metric_catalog(&mut conn, std::path::Path::new(&settings.system.metric_catalog_path))?;
        Ok(())
    })();

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn create_staging_cmd(settings: &Settings) -> ExitCode {
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };
    match staging::create_staging_if_not_exists(&mut conn) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn ingest_copy_cmd(settings: &Settings, mapping_path: &std::path::Path) -> ExitCode {
    let mapping = match mapping::load_mapping(mapping_path) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };

    let base_dir = std::path::PathBuf::from(&settings.system.data_dir);
    let entries = mapping::flatten(&mapping);
    let run_id = pumpflow_support::event_log::generate_run_id();
    let run_dir = compute_run_dir(std::path::Path::new(&settings.system.logs_dir), &run_id);
    if let Err(err) = std::fs::create_dir_all(&run_dir) {
        eprintln!("{err}");
        return ExitCode::from(EXIT_IO_ERROR);
    }
    let event_log = match pumpflow_support::event_log::RunEventLog::create(&run_dir, "pumpflow") {
        Ok(log) => Arc::new(std::sync::Mutex::new(log)),
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let stats = copy_loader::copy_from_mapping(pool, base_dir, entries, run_id, settings.ingest.clone(), event_log).await;
    if stats.files_failed > 0 && stats.files_succeeded == 0 {
        ExitCode::from(EXIT_DB_ERROR)
    } else {
        ExitCode::from(EXIT_OK)
    }
}

async fn merge_fact_cmd(
    settings: &Settings,
    window_start: chrono::DateTime<chrono::Utc>,
    window_end: chrono::DateTime<chrono::Utc>,
) -> ExitCode {
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };
    match merge::merge_window(
        &mut conn,
        window_start,
        window_end,
        &settings.merge.tz.default_station_tz,
        settings.merge.tz.allow_missing_tz,
    ) {
        Ok(stats) => {
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn check_mapping_cmd(mapping_path: &std::path::Path) -> ExitCode {
    let mapping = match mapping::load_mapping(mapping_path) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    let base_dir = mapping_path.parent().unwrap_or(std::path::Path::new("."));
    let report = mapping::check_mapping_paths(base_dir, &mapping);
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    ExitCode::from(EXIT_OK)
}

async fn data_report_cmd(
    settings: &Settings,
    window_start: chrono::DateTime<chrono::Utc>,
    window_end: chrono::DateTime<chrono::Utc>,
    expected_interval: i64,
    top_k: i64,
    group_by: &str,
) -> ExitCode {
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };
    let params = QualityReportParams {
        start_utc: window_start,
        end_utc: window_end,
        expected_interval_seconds: expected_interval,
        top_k,
        group_by: GroupBy::parse(group_by),
    };
    match generate_quality_report(&mut conn, &params) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn run_all_cmd(
    settings: &Settings,
    mapping: std::path::PathBuf,
    use_staging_time_range: bool,
    window_start: Option<chrono::DateTime<chrono::Utc>>,
    window_end: Option<chrono::DateTime<chrono::Utc>>,
    summary_json: Option<std::path::PathBuf>,
    reset_staging: bool,
) -> ExitCode {
    let (window_start, window_end) = match (use_staging_time_range, window_start, window_end) {
        (true, _, _) => (chrono::Utc::now(), chrono::Utc::now()),
        (false, Some(start), Some(end)) => (start, end),
        _ => {
            eprintln!("run-all requires either --use-staging-time-range or both --window-start and --window-end");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };

    let run_id = pumpflow_support::event_log::generate_run_id();
    let run_dir = compute_run_dir(std::path::Path::new(&settings.system.logs_dir), &run_id);
    let request = RunRequest {
        mapping_path: mapping,
        base_dir: std::path::PathBuf::from(&settings.system.data_dir),
        window_start,
        window_end,
        use_staging_time_range,
        run_dir,
        run_id,
        write_summary_json: summary_json.is_some(),
        reset_staging,
    };

    match run_all(settings, pool, request).await {
        Ok(_summary) => ExitCode::from(EXIT_OK),
        Err(run::RunError::Mapping(_)) => ExitCode::from(EXIT_IO_ERROR),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn admin_clear_db_cmd(settings: &Settings) -> ExitCode {
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    let mut conn = match pool.acquire() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(EXIT_DB_ERROR);
        }
    };
    let result: QueryResult<()> = (|| {
        staging::truncate_staging(&mut conn)?;
        diesel::sql_query("TRUNCATE TABLE public.fact_measurements").execute(&mut conn)?;
        Ok(())
    })();
    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}

async fn db_ping_cmd(settings: &Settings, verbose: bool) -> ExitCode {
    let pool = match open_pool(settings) {
        Ok(p) => p,
        Err(code) => return code,
    };
    match pool.acquire() {
        Ok(mut conn) => match diesel::sql_query("SELECT 1").execute(&mut conn) {
            Ok(_) => {
                if verbose {
                    println!("db-ping: ok ({})", pumpflow_db::url::postgres_url(&settings.db));
                }
                ExitCode::from(EXIT_OK)
            }
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(EXIT_DB_ERROR)
            }
        },
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_DB_ERROR)
        }
    }
}
