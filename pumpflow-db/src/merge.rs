use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Text, Timestamptz};
use diesel::PgConnection;
use miette::Diagnostic;
use pumpflow_support::types::MergeStats;
use thiserror::Error;

use crate::partition::ensure_fact_weekly_partitions;

/// The canonical merge statement, defined exactly once. Earlier drafts of
/// this query (in the system this behavior is grounded on) rewrote the SQL
/// string mid-function to patch a broken CTE; here there is only ever one
/// version, reused for both the `EXPLAIN` capture path and the live
/// execution path.
const MERGE_SQL_V1: &str = r#"
WITH parsed AS (
  SELECT
    ds.id AS station_id,
    dd.id AS device_id,
    dmc.id AS metric_id,
    (to_timestamp(rtrim(replace(split_part(sr."DataTime", '.', 1), 'T', ' '), 'Z'), 'YYYY-MM-DD HH24:MI:SS')
      AT TIME ZONE COALESCE(ds.extra->>'tz', $3)) AS ts_utc,
    sr."DataValue"::numeric AS val,
    sr.source_hint
  FROM public.staging_raw sr
  JOIN public.dim_stations ds ON ds.name = sr.station_name
  JOIN public.dim_devices dd ON dd.station_id = ds.id AND dd.name = sr.device_name
  JOIN public.dim_metric_config dmc ON dmc.metric_key = sr.metric_key
), dedup AS (
  SELECT *,
         date_trunc('second', ts_utc) AS ts_bucket,
         row_number() OVER (
           PARTITION BY station_id, device_id, metric_id, date_trunc('second', ts_utc)
           ORDER BY ts_utc DESC
         ) AS rn
  FROM parsed
)
INSERT INTO public.fact_measurements(station_id, device_id, metric_id, ts_raw, ts_bucket, value, source_hint)
SELECT station_id, device_id, metric_id, ts_utc, ts_bucket, val, source_hint
FROM dedup
WHERE rn = 1 AND ts_bucket >= $1 AND ts_bucket < $2
ON CONFLICT (station_id, device_id, metric_id, ts_bucket)
DO UPDATE SET value = EXCLUDED.value, source_hint = EXCLUDED.source_hint, ts_raw = EXCLUDED.ts_raw
"#;

/// Paired stats query sharing `parsed`/`dedup` semantics with [`MERGE_SQL_V1`],
/// so the reported counts always describe exactly what the merge statement did.
const STATS_SQL_V1: &str = r#"
WITH parsed AS (
  SELECT
    ds.id AS station_id,
    dd.id AS device_id,
    dmc.id AS metric_id,
    (to_timestamp(rtrim(replace(split_part(sr."DataTime", '.', 1), 'T', ' '), 'Z'), 'YYYY-MM-DD HH24:MI:SS')
      AT TIME ZONE COALESCE(ds.extra->>'tz', $3)) AS ts_utc
  FROM public.staging_raw sr
  JOIN public.dim_stations ds ON ds.name = sr.station_name
  JOIN public.dim_devices dd ON dd.station_id = ds.id AND dd.name = sr.device_name
  JOIN public.dim_metric_config dmc ON dmc.metric_key = sr.metric_key
), dedup AS (
  SELECT date_trunc('second', ts_utc) AS ts_bucket,
         row_number() OVER (
           PARTITION BY station_id, device_id, metric_id, date_trunc('second', ts_utc)
           ORDER BY ts_utc DESC
         ) AS rn
  FROM parsed
)
SELECT
  count(*) FILTER (WHERE rn = 1 AND ts_bucket >= $1 AND ts_bucket < $2) AS rows_merged,
  count(*) FILTER (WHERE rn > 1 AND ts_bucket >= $1 AND ts_bucket < $2) AS rows_deduped,
  count(*) FILTER (WHERE ts_bucket >= $1 AND ts_bucket < $2) AS rows_in
FROM dedup
"#;

#[derive(Debug, Error, Diagnostic)]
#[error("merge failed for window [{window_start}, {window_end})")]
pub struct MergeError {
    pub window_start: String,
    pub window_end: String,
    pub explain: Option<String>,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

#[derive(Debug, Error, Diagnostic)]
#[error("{count} row(s) in [{window_start}, {window_end}) have no explicit station tz and allow_missing_tz is false")]
pub struct MissingTzError {
    pub window_start: String,
    pub window_end: String,
    pub count: i64,
}

#[derive(QueryableByName)]
struct StatsRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    rows_merged: i64,
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    rows_deduped: i64,
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    rows_in: i64,
}

#[derive(QueryableByName)]
struct ExplainRow {
    #[diesel(sql_type = Text, column_name = "QUERY PLAN")]
    query_plan: String,
}

/// Runs one merge segment: ensures partitions exist, executes the upsert,
/// then the paired stats query. On any SQL error, attempts to attach an
/// `EXPLAIN` of the merge statement (truncated to 2000 chars) before
/// re-raising — the segment's transaction is rolled back either way.
pub fn merge_window(
    conn: &mut PgConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    default_station_tz: &str,
    allow_missing_tz: bool,
) -> Result<MergeStats, MergeError> {
    ensure_fact_weekly_partitions(conn, window_start, window_end).map_err(|source| MergeError {
        window_start: window_start.to_rfc3339(),
        window_end: window_end.to_rfc3339(),
        explain: None,
        source: Box::new(source),
    })?;

    if !allow_missing_tz {
        let fallback_count = count_tz_fallback(conn, window_start, window_end, default_station_tz).map_err(|source| {
            MergeError {
                window_start: window_start.to_rfc3339(),
                window_end: window_end.to_rfc3339(),
                explain: None,
                source: Box::new(source),
            }
        })?;
        if fallback_count > 0 {
            return Err(MergeError {
                window_start: window_start.to_rfc3339(),
                window_end: window_end.to_rfc3339(),
                explain: None,
                source: Box::new(MissingTzError {
                    window_start: window_start.to_rfc3339(),
                    window_end: window_end.to_rfc3339(),
                    count: fallback_count,
                }),
            });
        }
    }

    let started = std::time::Instant::now();

    let result = conn.transaction(|conn| {
        diesel::sql_query(MERGE_SQL_V1)
            .bind::<Timestamptz, _>(window_start)
            .bind::<Timestamptz, _>(window_end)
            .bind::<Text, _>(default_station_tz)
            .execute(conn)?;

        diesel::sql_query(STATS_SQL_V1)
            .bind::<Timestamptz, _>(window_start)
            .bind::<Timestamptz, _>(window_end)
            .bind::<Text, _>(default_station_tz)
            .get_result::<StatsRow>(conn)
    });

    match result {
        Ok(stats) => {
            let rows_in = stats.rows_in.max(0) as u64;
            let rows_deduped = stats.rows_deduped.max(0) as u64;
            let rows_merged = stats.rows_merged.max(0) as u64;
            Ok(MergeStats {
                rows_in,
                rows_deduped,
                rows_merged,
                dedup_ratio: rows_deduped as f64 / rows_in.max(1) as f64,
                sql_cost_ms: started.elapsed().as_millis() as u64,
                affected_rows: rows_merged,
            })
        }
        Err(source) => {
            let explain = capture_explain(conn, window_start, window_end, default_station_tz);
            Err(MergeError {
                window_start: window_start.to_rfc3339(),
                window_end: window_end.to_rfc3339(),
                explain,
                source: Box::new(source),
            })
        }
    }
}

#[derive(QueryableByName)]
struct StagingRangeRow {
    #[diesel(sql_type = diesel::sql_types::Nullable<Timestamptz>)]
    min_ts: Option<DateTime<Utc>>,
    #[diesel(sql_type = diesel::sql_types::Nullable<Timestamptz>)]
    max_ts: Option<DateTime<Utc>>,
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    count: i64,
}

/// Scans all of `staging_raw` (no window filter) for the min/max parsed
/// timestamp, used by `--use-staging-time-range` to derive a merge window
/// from whatever was just loaded rather than a caller-supplied one.
pub fn staging_time_range(
    conn: &mut PgConnection,
    default_station_tz: &str,
) -> QueryResult<Option<(DateTime<Utc>, DateTime<Utc>, i64)>> {
    let row = diesel::sql_query(
        r#"
        SELECT min(ts_utc) AS min_ts, max(ts_utc) AS max_ts, count(*) AS count
        FROM (
          SELECT
            (to_timestamp(rtrim(replace(split_part(sr."DataTime", '.', 1), 'T', ' '), 'Z'), 'YYYY-MM-DD HH24:MI:SS')
              AT TIME ZONE COALESCE(ds.extra->>'tz', $1)) AS ts_utc
          FROM public.staging_raw sr
          JOIN public.dim_stations ds ON ds.name = sr.station_name
        ) parsed
        "#,
    )
    .bind::<Text, _>(default_station_tz)
    .get_result::<StagingRangeRow>(conn)?;

    Ok(match (row.min_ts, row.max_ts) {
        (Some(min_ts), Some(max_ts)) if row.count > 0 => Some((min_ts, max_ts, row.count)),
        _ => None,
    })
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    count: i64,
}

/// Counts rows in `[window_start, window_end)` whose station carries no
/// explicit `extra->>'tz'`, i.e. rows whose timestamp was interpreted
/// against `default_station_tz` rather than a station-specific zone.
pub fn count_tz_fallback(
    conn: &mut PgConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    default_station_tz: &str,
) -> QueryResult<i64> {
    let row = diesel::sql_query(
        r#"
        WITH parsed AS (
          SELECT
            (to_timestamp(rtrim(replace(split_part(sr."DataTime", '.', 1), 'T', ' '), 'Z'), 'YYYY-MM-DD HH24:MI:SS')
              AT TIME ZONE COALESCE(ds.extra->>'tz', $3)) AS ts_utc,
            ds.extra->>'tz' AS station_tz
          FROM public.staging_raw sr
          JOIN public.dim_stations ds ON ds.name = sr.station_name
        )
        SELECT count(*) AS count
        FROM parsed
        WHERE station_tz IS NULL AND ts_utc >= $1 AND ts_utc < $2
        "#,
    )
    .bind::<Timestamptz, _>(window_start)
    .bind::<Timestamptz, _>(window_end)
    .bind::<Text, _>(default_station_tz)
    .get_result::<CountRow>(conn)
    .map(|r| r.count)
}

fn capture_explain(
    conn: &mut PgConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    default_station_tz: &str,
) -> Option<String> {
    let explain_sql = format!("EXPLAIN {MERGE_SQL_V1}");
    let rows = diesel::sql_query(explain_sql)
        .bind::<Timestamptz, _>(window_start)
        .bind::<Timestamptz, _>(window_end)
        .bind::<Text, _>(default_station_tz)
        .get_results::<ExplainRow>(conn)
        .ok()?;
    let joined: String = rows.into_iter().map(|r| r.query_plan).collect::<Vec<_>>().join("\n");
    Some(joined.chars().take(2000).collect())
}
