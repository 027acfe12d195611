use diesel::prelude::*;
use diesel::PgConnection;
use pumpflow_support::types::{RejectRow, ValidRow};

use crate::models::{NewStagingReject, NewStagingRow};
use crate::schema::{staging_raw, staging_rejects};

/// Bulk-loads a batch of valid rows into `staging_raw` via `COPY`, the same
/// mechanism `insert_entities` uses for its own bulk insert path. `station`,
/// `device`, and `metric_key` are supplied by the caller (the COPY loader),
/// not by the CSV reader.
pub fn copy_valid_rows(
    conn: &mut PgConnection,
    station: &str,
    device: &str,
    metric_key: &str,
    rows: &[ValidRow],
) -> QueryResult<usize> {
    let new_rows: Vec<NewStagingRow> = rows
        .iter()
        .map(|row| NewStagingRow {
            station_name: station.to_owned(),
            device_name: device.to_owned(),
            metric_key: metric_key.to_owned(),
            tag_name: row.tag_name.clone(),
            data_time: row.data_time.clone(),
            data_value: row.data_value.clone(),
            source_hint: row.source_hint.clone(),
        })
        .collect();

    diesel::copy_from(staging_raw::table)
        .from_insertable(&new_rows)
        .execute(conn)
}

/// Bulk-loads rejected rows into `staging_rejects` via a batched `INSERT`
/// (rejects are comparatively rare; a plain multi-row insert is simpler
/// than standing up a second COPY stream).
pub fn insert_rejects(conn: &mut PgConnection, rejects: &[RejectRow]) -> QueryResult<usize> {
    let new_rejects: Vec<NewStagingReject> = rejects
        .iter()
        .map(|r| NewStagingReject {
            station_name: r.station_name.clone(),
            device_name: r.device_name.clone(),
            metric_key: r.metric_key.clone(),
            tag_name: r.raw_tag_name.clone(),
            data_time: r.raw_data_time.clone(),
            data_value: r.raw_data_value.clone(),
            source_hint: r.source_hint.clone(),
            error_msg: r.reason.clone(),
        })
        .collect();

    diesel::insert_into(staging_rejects::table)
        .values(&new_rejects)
        .execute(conn)
}
