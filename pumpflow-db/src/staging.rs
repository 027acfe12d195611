use diesel::prelude::*;
use diesel::PgConnection;

const CREATE_STAGING_RAW_SQL: &str = r#"
CREATE UNLOGGED TABLE IF NOT EXISTS public.staging_raw (
    station_name text,
    device_name text,
    metric_key text,
    "TagName" text,
    "DataTime" text,
    "DataValue" text,
    source_hint text,
    loaded_at timestamptz DEFAULT now()
) WITH (autovacuum_enabled = true);
"#;

const CREATE_STAGING_REJECTS_SQL: &str = r#"
CREATE UNLOGGED TABLE IF NOT EXISTS public.staging_rejects (
    station_name text,
    device_name text,
    metric_key text,
    "TagName" text,
    "DataTime" text,
    "DataValue" text,
    source_hint text,
    error_msg text,
    rejected_at timestamptz DEFAULT now()
) WITH (autovacuum_enabled = true);
"#;

/// Idempotently creates the two staging tables if they are absent.
/// Never truncates them — that is an explicit, separate operator action
/// (`reset_staging`), never an implicit side effect of a normal run.
pub fn create_staging_if_not_exists(conn: &mut PgConnection) -> QueryResult<()> {
    diesel::sql_query(CREATE_STAGING_RAW_SQL).execute(conn)?;
    diesel::sql_query(CREATE_STAGING_REJECTS_SQL).execute(conn)?;
    Ok(())
}

pub fn truncate_staging(conn: &mut PgConnection) -> QueryResult<()> {
    diesel::sql_query("TRUNCATE TABLE public.staging_raw, public.staging_rejects").execute(conn)?;
    Ok(())
}
