use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Nullable, Text, Timestamptz};
use diesel::PgConnection;
use serde_json::{Map, Value};

/// The five grouping keys `generate_report` supports. `Batch` and `Source`
/// are both derived from `fact_measurements.source_hint`, which encodes
/// `<rel-path>|batch=<run_id>|ver=2` (see `source_hint::make_source_hint`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Metric,
    Device,
    Station,
    Batch,
    Source,
}

impl GroupBy {
    /// Parses a `group_by` CLI/report parameter. Unrecognized values fall
    /// back to `Metric`, same as the original's default branch.
    pub fn parse(raw: &str) -> GroupBy {
        match raw.trim().to_lowercase().as_str() {
            "device" => GroupBy::Device,
            "station" => GroupBy::Station,
            "batch" => GroupBy::Batch,
            "source" => GroupBy::Source,
            _ => GroupBy::Metric,
        }
    }

    pub fn key_name(&self) -> &'static str {
        match self {
            GroupBy::Metric => "metric_id",
            GroupBy::Device => "device_id",
            GroupBy::Station => "station_id",
            GroupBy::Batch => "batch",
            GroupBy::Source => "source",
        }
    }

    /// Same SQL fragments as `_grp_expr`, cast to text so every grouping can
    /// be bound through one `QueryableByName` row shape regardless of
    /// whether the underlying column is a bigint id or a split_part string.
    fn sql_expr(&self, alias: &str) -> String {
        match self {
            GroupBy::Metric => format!("({alias}.metric_id)::text"),
            GroupBy::Device => format!("({alias}.device_id)::text"),
            GroupBy::Station => format!("({alias}.station_id)::text"),
            GroupBy::Batch => format!("split_part(split_part({alias}.source_hint, '|', 2), '=', 2)"),
            GroupBy::Source => format!("split_part({alias}.source_hint, '|', 1)"),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, GroupBy::Metric | GroupBy::Device | GroupBy::Station)
    }

    fn json_value(&self, raw: &str) -> Value {
        if self.is_numeric() {
            raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(raw))
        } else {
            Value::from(raw)
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityReportParams {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub expected_interval_seconds: i64,
    pub top_k: i64,
    pub group_by: GroupBy,
}

/// Builds the DB-backed portion of the data-quality report: `coverage_top`,
/// `histogram_hourly`, `coverage_rate`, `gaps_top`, `outliers_agg`,
/// `quantiles`, and `zero_const`, keyed exactly as `generate_report` keys
/// them (`window`/`params` plus the seven sections). `perf` is assembled
/// separately by [`summarize_perf_log`] since it reads a run directory, not
/// the database.
pub fn generate_quality_report(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Value> {
    let mut out = Map::new();
    out.insert(
        "window".into(),
        serde_json::json!({
            "start": params.start_utc.to_rfc3339(),
            "end": params.end_utc.to_rfc3339(),
        }),
    );
    out.insert(
        "params".into(),
        serde_json::json!({
            "expected_interval_seconds": params.expected_interval_seconds,
            "top_k": params.top_k,
            "group_by": params.group_by.key_name(),
        }),
    );

    out.insert("coverage_top".into(), Value::Array(coverage_top(conn, params)?));
    out.insert("histogram_hourly".into(), Value::Array(histogram_hourly(conn, params)?));

    let (coverage_rate, gaps_top) = coverage_rate_and_gaps(conn, params)?;
    out.insert("coverage_rate".into(), Value::Array(coverage_rate));
    out.insert("gaps_top".into(), Value::Array(gaps_top));

    out.insert("outliers_agg".into(), Value::Array(outliers_agg(conn, params)?));
    out.insert("quantiles".into(), Value::Array(quantiles(conn, params)?));
    out.insert("zero_const".into(), Value::Array(zero_const(conn, params)?));

    Ok(Value::Object(out))
}

#[derive(QueryableByName)]
struct CoverageTopRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    ts_min: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    ts_max: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    rows: i64,
}

fn coverage_top(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Vec<Value>> {
    let grp_sql = params.group_by.sql_expr("f");
    let sql = format!(
        "WITH base AS ( \
           SELECT {grp_sql} AS grp, min(ts_bucket) AS ts_min, max(ts_bucket) AS ts_max, count(*) AS rows \
           FROM public.fact_measurements f \
           WHERE ts_bucket >= $1 AND ts_bucket < $2 \
           GROUP BY {grp_sql} \
         ) \
         SELECT grp, ts_min, ts_max, rows FROM base ORDER BY rows DESC LIMIT $3"
    );
    let rows = diesel::sql_query(sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<CoverageTopRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("ts_min".into(), r.ts_min.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null));
            m.insert("ts_max".into(), r.ts_max.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null));
            m.insert("rows".into(), Value::from(r.rows));
            Value::Object(m)
        })
        .collect())
}

#[derive(QueryableByName)]
struct HistogramRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = Timestamptz)]
    bucket: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    rows: i64,
}

fn histogram_hourly(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Vec<Value>> {
    let grp_sql = params.group_by.sql_expr("f");
    let sql = format!(
        "WITH tops AS ( \
           SELECT {grp_sql} AS grp, count(*) AS rows \
           FROM public.fact_measurements f \
           WHERE ts_bucket >= $1 AND ts_bucket < $2 \
           GROUP BY {grp_sql} ORDER BY rows DESC LIMIT $3 \
         ) \
         SELECT t.grp, date_trunc('hour', f.ts_bucket) AS bucket, count(*) AS rows \
         FROM public.fact_measurements f \
         JOIN tops t ON t.grp = {grp_sql} \
         WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
         GROUP BY t.grp, date_trunc('hour', f.ts_bucket) \
         ORDER BY t.grp, bucket"
    );
    let rows = diesel::sql_query(sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<HistogramRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("bucket".into(), Value::from(r.bucket.to_rfc3339()));
            m.insert("rows".into(), Value::from(r.rows));
            Value::Object(m)
        })
        .collect())
}

#[derive(QueryableByName)]
struct CoverageRateRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    ts_min: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    ts_max: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    rows: i64,
    #[diesel(sql_type = Double)]
    gap_seconds: f64,
}

#[derive(QueryableByName)]
struct GapRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = Timestamptz)]
    gap_start: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    gap_end: DateTime<Utc>,
    #[diesel(sql_type = Double)]
    gap_seconds: f64,
}

/// Runs the coverage-rate and gap-detail queries together: both share the
/// `tops`/`seq` lag-window construction, so they're grounded on one
/// function even though the original issues them as two separate
/// `cur.execute` calls against the same window.
fn coverage_rate_and_gaps(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<(Vec<Value>, Vec<Value>)> {
    let grp_sql = params.group_by.sql_expr("f");
    let gap_threshold = params.expected_interval_seconds as f64 * 1.5;

    let coverage_sql = format!(
        "WITH tops AS ( \
           SELECT {grp_sql} AS grp, count(*) AS rows \
           FROM public.fact_measurements f \
           WHERE ts_bucket >= $1 AND ts_bucket < $2 \
           GROUP BY {grp_sql} ORDER BY rows DESC LIMIT $3 \
         ), seq AS ( \
           SELECT {grp_sql} AS grp, f.ts_bucket AS ts, \
                  lag(f.ts_bucket) OVER (PARTITION BY {grp_sql} ORDER BY f.ts_bucket) AS prev \
           FROM public.fact_measurements f \
           JOIN tops t ON t.grp = {grp_sql} \
           WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
         ) \
         SELECT t.grp, min(s.ts) AS ts_min, max(s.ts) AS ts_max, count(*) AS rows, \
                sum(CASE WHEN s.prev IS NOT NULL AND EXTRACT(EPOCH FROM (s.ts - s.prev)) > $4 \
                         THEN EXTRACT(EPOCH FROM (s.ts - s.prev)) ELSE 0 END) AS gap_seconds \
         FROM seq s JOIN tops t ON t.grp = s.grp \
         GROUP BY t.grp ORDER BY rows DESC"
    );
    let cov_rows = diesel::sql_query(coverage_sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .bind::<Double, _>(gap_threshold)
        .get_results::<CoverageRateRow>(conn)?;

    let coverage_rate = cov_rows
        .into_iter()
        .map(|r| {
            let expected = match (r.ts_min, r.ts_max) {
                (Some(min), Some(max)) => {
                    let total_span = ((max - min).num_seconds() + 1).max(1);
                    (total_span as f64 / params.expected_interval_seconds.max(1) as f64).ceil().max(1.0) as i64
                }
                _ => r.rows,
            };
            let rate = if expected > 0 { (r.rows as f64 / expected as f64).min(1.0) } else { 1.0 };
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("rows".into(), Value::from(r.rows));
            m.insert("expected_rows".into(), Value::from(expected));
            m.insert("coverage_rate".into(), Value::from(round4(rate)));
            m.insert("gap_seconds_sum".into(), Value::from(r.gap_seconds.max(0.0) as i64));
            Value::Object(m)
        })
        .collect();

    let gaps_sql = format!(
        "WITH seq AS ( \
           SELECT {grp_sql} AS grp, f.ts_bucket AS ts, \
                  lag(f.ts_bucket) OVER (PARTITION BY {grp_sql} ORDER BY f.ts_bucket) AS prev \
           FROM public.fact_measurements f \
           WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
         ) \
         SELECT grp, prev AS gap_start, ts AS gap_end, EXTRACT(EPOCH FROM (ts - prev)) AS gap_seconds \
         FROM seq WHERE prev IS NOT NULL AND EXTRACT(EPOCH FROM (ts - prev)) > $3 \
         ORDER BY gap_seconds DESC LIMIT $4"
    );
    let gap_rows = diesel::sql_query(gaps_sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<Double, _>(gap_threshold)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<GapRow>(conn)?;

    let gaps_top = gap_rows
        .into_iter()
        .map(|r| {
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("gap_start".into(), Value::from(r.gap_start.to_rfc3339()));
            m.insert("gap_end".into(), Value::from(r.gap_end.to_rfc3339()));
            m.insert("gap_seconds".into(), Value::from(r.gap_seconds as i64));
            Value::Object(m)
        })
        .collect();

    Ok((coverage_rate, gaps_top))
}

#[derive(QueryableByName)]
struct OutlierRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = BigInt)]
    rows: i64,
    #[diesel(sql_type = BigInt)]
    outliers: i64,
}

fn outliers_agg(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Vec<Value>> {
    let grp_sql = params.group_by.sql_expr("f");
    let sql = format!(
        "WITH totals AS ( \
           SELECT {grp_sql} AS grp, count(*) AS rows \
           FROM public.fact_measurements f \
           WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
           GROUP BY {grp_sql} \
         ), viol AS ( \
           SELECT {grp_sql} AS grp, count(*) AS outliers \
           FROM public.fact_measurements f \
           JOIN public.dim_metric_config c ON c.id = f.metric_id \
           WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
             AND ((c.valid_min IS NOT NULL AND f.value < c.valid_min) OR (c.valid_max IS NOT NULL AND f.value > c.valid_max)) \
           GROUP BY {grp_sql} \
         ) \
         SELECT t.grp, t.rows, COALESCE(v.outliers, 0) AS outliers \
         FROM totals t LEFT JOIN viol v ON v.grp = t.grp \
         ORDER BY outliers DESC LIMIT $3"
    );
    let rows = diesel::sql_query(sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<OutlierRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let ratio = if r.rows > 0 { r.outliers as f64 / r.rows as f64 } else { 0.0 };
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("rows".into(), Value::from(r.rows));
            m.insert("outliers".into(), Value::from(r.outliers));
            m.insert("outlier_ratio".into(), Value::from(round6(ratio)));
            Value::Object(m)
        })
        .collect())
}

#[derive(QueryableByName)]
struct QuantileRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = Nullable<Double>)]
    p01: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    p50: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    p95: Option<f64>,
}

fn quantiles(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Vec<Value>> {
    let grp_sql = params.group_by.sql_expr("f");
    let sql = format!(
        "SELECT {grp_sql} AS grp, \
                (percentile_disc(0.01) WITHIN GROUP (ORDER BY f.value))::double precision AS p01, \
                (percentile_disc(0.5)  WITHIN GROUP (ORDER BY f.value))::double precision AS p50, \
                (percentile_disc(0.95) WITHIN GROUP (ORDER BY f.value))::double precision AS p95 \
         FROM public.fact_measurements f \
         WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
         GROUP BY {grp_sql} ORDER BY grp LIMIT $3"
    );
    let rows = diesel::sql_query(sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<QuantileRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("p01".into(), r.p01.map(Value::from).unwrap_or(Value::Null));
            m.insert("p50".into(), r.p50.map(Value::from).unwrap_or(Value::Null));
            m.insert("p95".into(), r.p95.map(Value::from).unwrap_or(Value::Null));
            Value::Object(m)
        })
        .collect())
}

#[derive(QueryableByName)]
struct ZeroConstRow {
    #[diesel(sql_type = Text)]
    grp: String,
    #[diesel(sql_type = BigInt)]
    rows: i64,
    #[diesel(sql_type = BigInt)]
    zeros: i64,
    #[diesel(sql_type = BigInt)]
    max_same: i64,
}

fn zero_const(conn: &mut PgConnection, params: &QualityReportParams) -> QueryResult<Vec<Value>> {
    let grp_sql = params.group_by.sql_expr("f");
    let sql = format!(
        "WITH totals AS ( \
           SELECT {grp_sql} AS grp, count(*) AS rows \
           FROM public.fact_measurements f WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 GROUP BY {grp_sql} \
         ), zeros AS ( \
           SELECT {grp_sql} AS grp, sum(CASE WHEN f.value = 0 THEN 1 ELSE 0 END) AS zeros \
           FROM public.fact_measurements f WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 GROUP BY {grp_sql} \
         ), consts AS ( \
           SELECT t.grp AS grp, max(cnt) AS max_same \
           FROM ( \
             SELECT {grp_sql} AS grp, value, count(*) AS cnt \
             FROM public.fact_measurements f WHERE f.ts_bucket >= $1 AND f.ts_bucket < $2 \
             GROUP BY {grp_sql}, value \
           ) t GROUP BY t.grp \
         ) \
         SELECT t.grp, t.rows, COALESCE(z.zeros, 0) AS zeros, COALESCE(c.max_same, 0) AS max_same \
         FROM totals t \
         LEFT JOIN zeros z ON z.grp = t.grp \
         LEFT JOIN consts c ON c.grp = t.grp \
         ORDER BY (COALESCE(z.zeros, 0)::float / GREATEST(t.rows, 1)) DESC \
         LIMIT $3"
    );
    let rows = diesel::sql_query(sql)
        .bind::<Timestamptz, _>(params.start_utc)
        .bind::<Timestamptz, _>(params.end_utc)
        .bind::<BigInt, _>(params.top_k)
        .get_results::<ZeroConstRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let zero_ratio = if r.rows > 0 { r.zeros as f64 / r.rows as f64 } else { 0.0 };
            let const_ratio = if r.rows > 0 { r.max_same as f64 / r.rows as f64 } else { 0.0 };
            let mut m = Map::new();
            m.insert(params.group_by.key_name().into(), params.group_by.json_value(&r.grp));
            m.insert("rows".into(), Value::from(r.rows));
            m.insert("zero_ratio".into(), Value::from(round6(zero_ratio)));
            m.insert("const_ratio".into(), Value::from(round6(const_ratio)));
            Value::Object(m)
        })
        .collect())
}

/// Summary of `ingest.copy.batch` events from a run's `perf.ndjson`, used
/// to attach ingest throughput percentiles to the data-quality report and
/// to `summary.json`'s diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerfSummary {
    pub batches: u64,
    pub batch_cost_ms_p50: i64,
    pub batch_cost_ms_p90: i64,
    pub batch_cost_ms_p95: i64,
    pub batch_cost_ms_p99: i64,
    pub batch_cost_ms_max: i64,
    pub batch_cost_ms_min: i64,
    pub rows_per_sec_p95: f64,
    pub fail_rate_avg: f64,
    pub fail_rate_p95: f64,
    pub fail_rate_max: f64,
    pub parse_errors: u64,
    pub missing: bool,
}

impl PerfSummary {
    fn empty(missing: bool) -> Self {
        Self {
            batches: 0,
            batch_cost_ms_p50: 0,
            batch_cost_ms_p90: 0,
            batch_cost_ms_p95: 0,
            batch_cost_ms_p99: 0,
            batch_cost_ms_max: 0,
            batch_cost_ms_min: 0,
            rows_per_sec_p95: 0.0,
            fail_rate_avg: 0.0,
            fail_rate_p95: 0.0,
            fail_rate_max: 0.0,
            parse_errors: 0,
            missing,
        }
    }
}

/// Reads `<run_dir>/perf.ndjson`, extracts every `ingest.copy.batch` line,
/// and computes the batch cost/fail-rate statistics attached to
/// `summary.json`'s diagnostics. Fields are flattened at the top level of
/// each line by [`crate::event_log`]-style writers (not nested under an
/// `"extra"` key), matching how [`pumpflow_support::event_log::EventLog`]
/// actually emits them.
pub fn summarize_perf_log(run_dir: &Path) -> PerfSummary {
    let perf_path = run_dir.join("perf.ndjson");
    let Ok(contents) = fs::read_to_string(&perf_path) else {
        return PerfSummary::empty(true);
    };

    let mut parse_errors = 0u64;
    let mut costs = Vec::new();
    let mut rps = Vec::new();
    let mut fail_rates = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || !line.contains("\"event\":\"ingest.copy.batch\"") && !line.contains("\"event\": \"ingest.copy.batch\"") {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => {
                costs.push(v.get("batch_cost_ms").and_then(Value::as_f64).unwrap_or(0.0));
                rps.push(v.get("rows_per_sec").and_then(Value::as_f64).unwrap_or(0.0));
                fail_rates.push(v.get("fail_rate").and_then(Value::as_f64).unwrap_or(0.0));
            }
            Err(_) => parse_errors += 1,
        }
    }

    PerfSummary {
        batches: costs.len() as u64,
        batch_cost_ms_p50: percentile(&costs, 0.50) as i64,
        batch_cost_ms_p90: percentile(&costs, 0.90) as i64,
        batch_cost_ms_p95: percentile(&costs, 0.95) as i64,
        batch_cost_ms_p99: percentile(&costs, 0.99) as i64,
        batch_cost_ms_max: if costs.is_empty() { 0 } else { costs.iter().cloned().fold(f64::MIN, f64::max) as i64 },
        batch_cost_ms_min: if costs.is_empty() { 0 } else { costs.iter().cloned().fold(f64::MAX, f64::min) as i64 },
        rows_per_sec_p95: round2(percentile(&rps, 0.95)),
        fail_rate_avg: round6(average(&fail_rates)),
        fail_rate_p95: round6(percentile(&fail_rates, 0.95)),
        fail_rate_max: round6(fail_rates.iter().cloned().fold(0.0, f64::max)),
        parse_errors,
        missing: false,
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Discrete percentile: sorts ascending and picks `max(0, floor(len * q) - 1)`,
/// matching the original's `_p95`-style helper (not an interpolated percentile).
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64 * q) as usize).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

pub fn percentile95(values: &[f64]) -> f64 {
    percentile(values, 0.95)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_parses_known_keys_and_defaults_to_metric() {
        assert_eq!(GroupBy::parse("device").key_name(), "device_id");
        assert_eq!(GroupBy::parse("BATCH").key_name(), "batch");
        assert_eq!(GroupBy::parse("nonsense").key_name(), "metric_id");
    }

    #[test]
    fn summarize_perf_log_reads_top_level_fields() {
        let dir = tempfile::tempdir().unwrap();
        let lines = (1..=10)
            .map(|n| {
                serde_json::json!({
                    "timestamp": "2025-01-01T00:00:00Z",
                    "level": "INFO",
                    "logger": "pumpflow",
                    "event": "ingest.copy.batch",
                    "message": "copy batch committed",
                    "batch_cost_ms": n * 100,
                    "rows_per_sec": 1000.0,
                    "fail_rate": 0.1,
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(dir.path().join("perf.ndjson"), lines).unwrap();

        let summary = summarize_perf_log(dir.path());
        assert!(!summary.missing);
        assert_eq!(summary.batches, 10);
        assert_eq!(summary.batch_cost_ms_max, 1000);
        assert_eq!(summary.batch_cost_ms_min, 100);
        assert!(summary.fail_rate_avg > 0.0);
    }

    #[test]
    fn summarize_perf_log_reports_missing_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summarize_perf_log(dir.path());
        assert!(summary.missing);
        assert_eq!(summary.batches, 0);
    }

    #[test]
    fn percentile95_matches_discrete_definition() {
        let values: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        assert_eq!(percentile95(&values), 95.0);
        assert_eq!(percentile95(&[]), 0.0);
        assert_eq!(percentile95(&[42.0]), 42.0);
    }

    #[test]
    fn numeric_group_json_value_parses_ids() {
        assert_eq!(GroupBy::Metric.json_value("7"), Value::from(7));
        assert_eq!(GroupBy::Source.json_value("data/a.csv"), Value::from("data/a.csv"));
    }
}
