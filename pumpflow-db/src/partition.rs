use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::PgConnection;
use miette::Diagnostic;
use thiserror::Error;

const HASH_BUCKETS: u32 = 16;

#[derive(Debug, Error, Diagnostic)]
pub enum PartitionError {
    #[error("error ensuring partitions for window [{window_start}, {window_end})")]
    Db {
        window_start: String,
        window_end: String,
        #[source]
        source: diesel::result::Error,
    },
}

/// Floors `dt` to the Monday 00:00:00 UTC of its ISO week.
pub fn floor_monday_utc(dt: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = dt.weekday().num_days_from_monday();
    let floored_date = dt.date_naive() - Duration::days(days_since_monday as i64);
    floored_date.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

fn week_partition_name(week_start: DateTime<Utc>) -> String {
    // ISO week label, matching `%Yw%V`.
    let iso = week_start.iso_week();
    format!("fact_measurements_{}w{:02}", iso.year(), iso.week())
}

/// Ensures a range partition (keyed by `ts_bucket`, one per ISO week) and
/// its 16 hash sub-partitions (keyed by `station_id`) exist for every week
/// intersecting `[window_start, window_end)`. Each creation is independently
/// `IF NOT EXISTS`-guarded via `to_regclass`, and the whole window's worth
/// of DDL runs inside one transaction — any failure rolls back so the
/// merge executor never sees a half-created partition.
pub fn ensure_fact_weekly_partitions(
    conn: &mut PgConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<(), PartitionError> {
    let start_w = floor_monday_utc(window_start);
    let window_end_week = floor_monday_utc(window_end);
    // window_end is an exclusive bound. If it lands exactly on a week's
    // Monday 00:00 UTC, that week contributes nothing to [window_start,
    // window_end) and must not get a partition; otherwise the week holding
    // window_end is still in range.
    let end_w =
        if window_end == window_end_week { window_end_week } else { window_end_week + Duration::days(7) };

    conn.transaction(|conn| {
        let mut cursor = start_w;
        while cursor < end_w {
            let next = cursor + Duration::days(7);
            ensure_week(conn, cursor, next)?;
            cursor = next;
        }
        diesel::result::QueryResult::Ok(())
    })
    .map_err(|source| PartitionError::Db {
        window_start: window_start.to_rfc3339(),
        window_end: window_end.to_rfc3339(),
        source,
    })
}

fn ensure_week(conn: &mut PgConnection, week_start: DateTime<Utc>, week_end: DateTime<Utc>) -> QueryResult<()> {
    let part_name = week_partition_name(week_start);

    if !regclass_exists(conn, &part_name)? {
        let create_partition_sql = format!(
            "CREATE TABLE public.{part_name} PARTITION OF public.fact_measurements \
             FOR VALUES FROM ('{}') TO ('{}') PARTITION BY HASH (station_id)",
            week_start.format("%Y-%m-%d %H:%M:%S+00"),
            week_end.format("%Y-%m-%d %H:%M:%S+00"),
        );
        diesel::sql_query(create_partition_sql).execute(conn)?;
    }

    for remainder in 0..HASH_BUCKETS {
        let sub_name = format!("{part_name}_p{remainder}");
        if regclass_exists(conn, &sub_name)? {
            continue;
        }
        let create_sub_sql = format!(
            "CREATE TABLE public.{sub_name} PARTITION OF public.{part_name} \
             FOR VALUES WITH (modulus {HASH_BUCKETS}, remainder {remainder})"
        );
        diesel::sql_query(create_sub_sql).execute(conn)?;

        let create_index_sql = format!(
            "CREATE INDEX IF NOT EXISTS idx_{sub_name}_sdm_tb ON public.{sub_name} \
             (station_id, device_id, metric_id, ts_bucket) INCLUDE (value)"
        );
        diesel::sql_query(create_index_sql).execute(conn)?;
    }

    Ok(())
}

fn regclass_exists(conn: &mut PgConnection, name: &str) -> QueryResult<bool> {
    #[derive(QueryableByName)]
    struct Regclass {
        #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
        to_regclass: Option<String>,
    }
    let qualified = format!("public.{name}");
    let row = diesel::sql_query("SELECT to_regclass($1) AS to_regclass")
        .bind::<Text, _>(qualified)
        .get_result::<Regclass>(conn)?;
    Ok(row.to_regclass.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn floor_monday_handles_mid_week_timestamp() {
        // 2024-01-10 is a Wednesday.
        let dt = Utc.with_ymd_and_hms(2024, 1, 10, 15, 30, 0).unwrap();
        let floored = floor_monday_utc(dt);
        assert_eq!(floored.weekday(), Weekday::Mon);
        assert_eq!(floored.format("%Y-%m-%d").to_string(), "2024-01-08");
    }

    #[test]
    fn floor_monday_is_identity_on_monday_midnight() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        assert_eq!(floor_monday_utc(dt), dt);
    }

    #[test]
    fn week_partition_name_uses_iso_week_label() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        assert_eq!(week_partition_name(dt), "fact_measurements_2024w02");
    }
}
