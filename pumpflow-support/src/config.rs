use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Where an effective config value ultimately came from. Mirrors the
/// source-tagging the original config loader exposes for its `env.json`
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tag {
    Default,
    Yaml,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbPoolSettings {
    pub min_size: u32,
    pub max_size: u32,
    pub max_inactive_connection_lifetime_secs: u64,
}

impl Default for DbPoolSettings {
    fn default() -> Self {
        Self { min_size: 1, max_size: 10, max_inactive_connection_lifetime_secs: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTimeoutSettings {
    pub connect_timeout_ms: u64,
    pub statement_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for DbTimeoutSettings {
    fn default() -> Self {
        Self { connect_timeout_ms: 5_000, statement_timeout_ms: 30_000, query_timeout_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRetrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for DbRetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay_ms: 1_000, backoff_multiplier: 2.0 }
    }
}

/// Database connectivity config. Sourced only from file + defaults: no
/// `Env` provider is ever merged into this struct's figment, so there is no
/// path by which an environment variable can reach a `DbConfig` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub name: String,
    pub user: String,
    pub dsn_read: Option<String>,
    pub dsn_write: Option<String>,
    pub pool: DbPoolSettings,
    pub timeouts: DbTimeoutSettings,
    pub retry: DbRetrySettings,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            name: "pump_station_optimization".into(),
            user: "postgres".into(),
            dsn_read: None,
            dsn_write: None,
            pool: DbPoolSettings::default(),
            timeouts: DbTimeoutSettings::default(),
            retry: DbRetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub default_rate: f64,
    pub high_frequency_events: std::collections::BTreeMap<String, f64>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        let mut high_frequency_events = std::collections::BTreeMap::new();
        high_frequency_events.insert("ingest.load.progress".to_string(), 0.01);
        Self { default_rate: 1.0, high_frequency_events }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSqlSettings {
    pub text: String,
    pub explain: String,
    pub top_n_slow: usize,
}

impl Default for LoggingSqlSettings {
    fn default() -> Self {
        Self { text: "full".into(), explain: "on_error".into(), top_n_slow: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub sampling: SamplingSettings,
    pub sql: LoggingSqlSettings,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            sampling: SamplingSettings::default(),
            sql: LoggingSqlSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSettings {
    pub delimiter: char,
    pub encoding: String,
    pub quote_char: char,
    pub allow_bom: bool,
}

impl Default for CsvSettings {
    fn default() -> Self {
        Self { delimiter: ',', encoding: "utf-8".into(), quote_char: '"', allow_bom: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub size: usize,
    pub max_memory_mb: usize,
    pub parallel_batches: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { size: 50_000, max_memory_mb: 256, parallel_batches: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingSettings {
    pub max_errors_per_file: u64,
    pub error_threshold_percent: f64,
    pub continue_on_error: bool,
}

impl Default for ErrorHandlingSettings {
    fn default() -> Self {
        Self { max_errors_per_file: 100, error_threshold_percent: 5.0, continue_on_error: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureThresholds {
    pub p95_ms: u64,
    pub fail_rate: f64,
    pub min_batch: usize,
    pub min_workers: usize,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self { p95_ms: 2_000, fail_rate: 0.01, min_batch: 1_000, min_workers: 1 }
    }
}

/// Ingest config. The only settings struct with a whitelisted `Env`
/// provider merged in, matching `INGEST_WORKERS` / `INGEST_COMMIT_INTERVAL`
/// / `INGEST_P95_WINDOW` / `INGEST_ENHANCED_SOURCE_HINT` /
/// `INGEST_BATCH_ID_MODE` in the system this was distilled from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: usize,
    pub commit_interval: u64,
    pub p95_window: usize,
    pub enhanced_source_hint: bool,
    pub batch_id_mode: String,
    pub site_timezone: String,
    pub csv: CsvSettings,
    pub batch: BatchSettings,
    pub error_handling: ErrorHandlingSettings,
    pub backpressure_thresholds: BackpressureThresholds,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            commit_interval: 1_000_000,
            p95_window: 20,
            enhanced_source_hint: true,
            batch_id_mode: "run_id".into(),
            site_timezone: "Asia/Shanghai".into(),
            csv: CsvSettings::default(),
            batch: BatchSettings::default(),
            error_handling: ErrorHandlingSettings::default(),
            backpressure_thresholds: BackpressureThresholds::default(),
        }
    }
}

/// `base_dir` is pinned to `"data"` and deliberately has no `Deserialize`
/// path onto `IngestConfig` — it is supplied separately by the CLI entry
/// point, never by any config source.
pub const INGEST_BASE_DIR: &str = "data";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeTzPolicy {
    pub default_station_tz: String,
    pub allow_missing_tz: bool,
    pub missing_tz_policy: String,
}

impl Default for MergeTzPolicy {
    fn default() -> Self {
        Self {
            default_station_tz: "Asia/Shanghai".into(),
            allow_missing_tz: true,
            missing_tz_policy: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentedMergeSettings {
    pub enabled: bool,
    pub granularity: String,
}

impl Default for SegmentedMergeSettings {
    fn default() -> Self {
        Self { enabled: true, granularity: "1h".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub window_size: Option<String>,
    pub tz: MergeTzPolicy,
    pub segmented: SegmentedMergeSettings,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { window_size: Some("7d".into()), tz: MergeTzPolicy::default(), segmented: SegmentedMergeSettings::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub data_dir: String,
    pub logs_dir: String,
    pub default_timezone: String,
    pub storage_timezone: String,
    pub metric_catalog_path: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            logs_dir: "logs".into(),
            default_timezone: "Asia/Shanghai".into(),
            storage_timezone: "UTC".into(),
            metric_catalog_path: "config/metric_catalog.sql".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub db: DbConfig,
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub merge: MergeConfig,
    pub system: SystemConfig,
}

/// ENV vars honored for `IngestConfig`; every other struct is file+default only.
const INGEST_ENV_WHITELIST: &[&str] = &[
    "workers",
    "commit_interval",
    "p95_window",
    "enhanced_source_hint",
    "batch_id_mode",
];

/// Locates the config directory: an explicit override, else `./configs`,
/// else `./config`, first existing directory wins. Returns `None` if
/// neither exists, in which case every field falls back to its default.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        if dir.is_dir() {
            return Some(dir.to_path_buf());
        }
        return None;
    }
    for candidate in ["configs", "config"] {
        let path = PathBuf::from(candidate);
        if path.is_dir() {
            return Some(path);
        }
    }
    None
}

pub fn load_settings(config_dir: Option<&Path>) -> Result<Settings, figment::Error> {
    let dir = resolve_config_dir(config_dir);

    let db_figment = base_figment(&dir, "database.toml", DbConfig::default());
    let logging_figment = base_figment(&dir, "logging.toml", LoggingConfig::default());
    let merge_figment = base_figment(&dir, "merge.toml", MergeConfig::default());
    let system_figment = base_figment(&dir, "system.toml", SystemConfig::default());

    let ingest_figment = base_figment(&dir, "ingest.toml", IngestConfig::default())
        .merge(Env::prefixed("INGEST_").only(INGEST_ENV_WHITELIST));

    Ok(Settings {
        db: db_figment.extract()?,
        logging: logging_figment.extract()?,
        ingest: ingest_figment.extract()?,
        merge: merge_figment.extract()?,
        system: system_figment.extract()?,
    })
}

fn base_figment<T: Serialize>(dir: &Option<PathBuf>, file_name: &str, defaults: T) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(defaults));
    if let Some(dir) = dir {
        figment = figment.merge(Toml::file(dir.join(file_name)));
    }
    figment
}

/// Tags every whitelisted `IngestConfig` field with where its effective
/// value came from. Feeds `env.json`'s `config_summary` key so a run
/// artifact records provenance, not just the resolved values already in
/// `config_snapshot`.
pub fn ingest_config_summary() -> std::collections::BTreeMap<String, Tag> {
    INGEST_ENV_WHITELIST.iter().map(|&field| (field.to_string(), ingest_field_tag(field))).collect()
}

/// Resolves whether `field_name` on the ingest config section came from an
/// env var, the config file, or the compiled-in default — in that priority
/// order. Used to populate `env.json`'s per-field source tags.
pub fn ingest_field_tag(field_name: &str) -> Tag {
    if !INGEST_ENV_WHITELIST.contains(&field_name) {
        return Tag::Default;
    }
    let env_var = format!("INGEST_{}", field_name.to_uppercase());
    if std::env::var_os(&env_var).is_some() {
        return Tag::Env;
    }
    // Presence in the merged file is resolved by the caller, which holds
    // the raw file figment; absent that context we can only rule out Env.
    Tag::Yaml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_with_no_config_dir() {
        let settings = load_settings(None).expect("defaults must always be loadable");
        assert_eq!(settings.ingest.workers, 6);
        assert_eq!(settings.db.host, "localhost");
    }

    #[test]
    fn env_override_is_honored_for_whitelisted_ingest_field() {
        // SAFETY: test runs single-threaded within this process's env mutation window.
        unsafe { std::env::set_var("INGEST_WORKERS", "12") };
        let settings = load_settings(None).expect("defaults must always be loadable");
        assert_eq!(settings.ingest.workers, 12);
        unsafe { std::env::remove_var("INGEST_WORKERS") };
    }

    #[test]
    fn resolve_config_dir_prefers_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_config_dir(Some(tmp.path()));
        assert_eq!(resolved.as_deref(), Some(tmp.path()));
    }

    #[test]
    fn resolve_config_dir_returns_none_when_nothing_exists() {
        // Run from a directory we know has neither `configs/` nor `config/`.
        let tmp = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(tmp.path()).unwrap();
        let resolved = resolve_config_dir(None);
        std::env::set_current_dir(prev).unwrap();
        assert!(resolved.is_none());
    }
}
