use std::path::Path;

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use miette::Diagnostic;
use thiserror::Error;

use crate::schema::{dim_devices, dim_stations};

#[derive(Debug, Error, Diagnostic)]
pub enum DimensionError {
    #[error("database error preparing dimensions")]
    Db(#[source] diesel::result::Error),

    #[error("failed to read metric catalog script at {path}")]
    CatalogScriptIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<diesel::result::Error> for DimensionError {
    fn from(value: diesel::result::Error) -> Self {
        DimensionError::Db(value)
    }
}

/// Normalizes a raw `type` string from the mapping file. Unknown or absent
/// values default to `"pump"` rather than being rejected — devices in this
/// domain are overwhelmingly pumps, and a conservative default keeps a
/// typo'd mapping entry from blocking an entire ingest run.
pub fn normalize_device_type(raw: Option<&str>) -> &'static str {
    match raw.map(|s| s.trim().to_lowercase().replace('-', "_")) {
        Some(k) if matches!(k.as_str(), "main_pipeline" | "mainpipeline" | "main_pipe" | "pipeline" | "main") => {
            "main_pipeline"
        }
        _ => "pump",
    }
}

/// Normalizes a raw `pump_type` string; only meaningful when the device's
/// normalized type is `"pump"`. Anything unrecognized maps to `None`
/// (`dim_devices.pump_type` is nullable), never a fabricated category.
pub fn normalize_pump_type(device_type: &str, raw: Option<&str>) -> Option<&'static str> {
    if device_type != "pump" {
        return None;
    }
    let normalized = raw?.trim().to_lowercase().replace('-', "_");
    match normalized.as_str() {
        "variable_frequency" | "vf" | "variable" => Some("variable_frequency"),
        "soft_start" | "softstart" | "soft" => Some("soft_start"),
        _ => None,
    }
}

/// Advances each dimension's identity sequence to `MAX(id)`, repairing any
/// historical skew from out-of-band inserts before new rows are upserted.
pub fn ensure_sequences(conn: &mut PgConnection) -> Result<(), DimensionError> {
    for (table, seq) in [
        ("dim_stations", "dim_stations_id_seq"),
        ("dim_devices", "dim_devices_id_seq"),
        ("dim_metric_config", "dim_metric_config_id_seq"),
    ] {
        let max_id: i64 = diesel::sql_query(format!("SELECT COALESCE(MAX(id), 0) AS max_id FROM public.{table}"))
            .get_result::<MaxId>(conn)
            .map(|row| row.max_id)?;
        if max_id > 0 {
            diesel::sql_query(format!("SELECT setval('public.{seq}', $1, true)"))
                .bind::<BigInt, _>(max_id)
                .execute(conn)?;
        }
    }
    Ok(())
}

#[derive(QueryableByName)]
struct MaxId {
    #[diesel(sql_type = BigInt)]
    max_id: i64,
}

/// Idempotent upsert of a station by natural key `name`. Uses
/// `INSERT ... WHERE NOT EXISTS ... RETURNING id` with a select fallback,
/// tolerant of sequence skew that a plain `ON CONFLICT DO NOTHING RETURNING`
/// would mishandle when the row already existed before this process ran.
pub fn upsert_station(conn: &mut PgConnection, name: &str) -> Result<i64, DimensionError> {
    #[derive(QueryableByName)]
    struct IdRow {
        #[diesel(sql_type = BigInt)]
        id: i64,
    }

    let inserted = diesel::sql_query(
        "INSERT INTO public.dim_stations(name) SELECT $1 WHERE NOT EXISTS \
         (SELECT 1 FROM public.dim_stations WHERE name = $1) RETURNING id",
    )
    .bind::<Text, _>(name)
    .get_results::<IdRow>(conn)?;

    if let Some(row) = inserted.into_iter().next() {
        return Ok(row.id);
    }

    dim_stations::table
        .filter(dim_stations::name.eq(name))
        .select(dim_stations::id)
        .first(conn)
        .map_err(DimensionError::Db)
}

/// Idempotent upsert of a device by natural key `(station_id, name)`. Type
/// and pump_type are normalized by the caller before this is invoked.
pub fn upsert_device(
    conn: &mut PgConnection,
    station_id: i64,
    name: &str,
    device_type: &str,
    pump_type: Option<&str>,
) -> Result<i64, DimensionError> {
    #[derive(QueryableByName)]
    struct IdRow {
        #[diesel(sql_type = BigInt)]
        id: i64,
    }

    let inserted = diesel::sql_query(
        "INSERT INTO public.dim_devices(station_id, name, type, pump_type) \
         SELECT $1, $2, $3, $4 WHERE NOT EXISTS \
         (SELECT 1 FROM public.dim_devices WHERE station_id = $1 AND name = $2) RETURNING id",
    )
    .bind::<BigInt, _>(station_id)
    .bind::<Text, _>(name)
    .bind::<Text, _>(device_type)
    .bind::<diesel::sql_types::Nullable<Text>, _>(pump_type)
    .get_results::<IdRow>(conn)?;

    if let Some(row) = inserted.into_iter().next() {
        return Ok(row.id);
    }

    dim_devices::table
        .filter(dim_devices::station_id.eq(station_id).and(dim_devices::name.eq(name)))
        .select(dim_devices::id)
        .first(conn)
        .map_err(DimensionError::Db)
}

/// Truncates `dim_metric_config` (cascading, restarting identity) and
/// re-executes the authoritative catalog script at `catalog_sql_path`. The
/// mapping file is never treated as a source of truth for metric units or
/// bounds — only this script is.
pub fn reload_metric_catalog(conn: &mut PgConnection, catalog_sql_path: &Path) -> Result<u64, DimensionError> {
    let sql = std::fs::read_to_string(catalog_sql_path).map_err(|source| DimensionError::CatalogScriptIo {
        path: catalog_sql_path.display().to_string(),
        source,
    })?;

    conn.transaction(|conn| {
        diesel::sql_query("SET LOCAL statement_timeout = 0").execute(conn)?;
        diesel::sql_query("SET LOCAL lock_timeout = '5s'").execute(conn)?;
        diesel::sql_query("TRUNCATE TABLE public.dim_metric_config RESTART IDENTITY CASCADE").execute(conn)?;
        diesel::sql_query(sql).execute(conn)?;
        diesel::result::QueryResult::Ok(())
    })?;

    #[derive(QueryableByName)]
    struct CountRow {
        #[diesel(sql_type = BigInt)]
        count: i64,
    }
    let count: i64 = diesel::sql_query("SELECT COUNT(*) AS count FROM public.dim_metric_config")
        .get_result::<CountRow>(conn)
        .map(|r| r.count)?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_main_pipeline_aliases() {
        for alias in ["main_pipeline", "mainpipeline", "main-pipe", "pipeline", "MAIN"] {
            assert_eq!(normalize_device_type(Some(alias)), "main_pipeline");
        }
    }

    #[test]
    fn unknown_device_type_falls_back_to_pump() {
        assert_eq!(normalize_device_type(Some("submersible")), "pump");
        assert_eq!(normalize_device_type(None), "pump");
    }

    #[test]
    fn pump_type_only_applies_to_pump_devices() {
        assert_eq!(normalize_pump_type("main_pipeline", Some("variable_frequency")), None);
        assert_eq!(normalize_pump_type("pump", Some("vf")), Some("variable_frequency"));
        assert_eq!(normalize_pump_type("pump", Some("soft-start")), Some("soft_start"));
        assert_eq!(normalize_pump_type("pump", Some("unknown")), None);
    }
}
