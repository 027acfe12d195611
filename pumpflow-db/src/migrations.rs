use diesel::sql_types::BigInt;
use diesel::{Connection, ConnectionError, PgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{info, warn};
use miette::Diagnostic;
use pumpflow_support::config::DbConfig;
use std::error::Error;
use thiserror::Error;

use crate::url::postgres_url;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const MIGRATION_LOCK_ID: i64 = 58271;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrationError {
    #[error("couldn't connect to database")]
    FailedToConnectToDatabase(#[source] ConnectionError),

    #[error("error acquiring migrations lock")]
    FailedToAcquireMigrationsLock(#[source] diesel::result::Error),

    #[error("error running migrations")]
    FailedToRunMigrations(#[source] Box<dyn Error + Send + Sync>),
}

/// Runs all pending schema migrations under an advisory lock, so two
/// concurrently-starting processes don't race to create the same tables.
pub fn run_migrations(db: &DbConfig) -> Result<(), MigrationError> {
    let url = postgres_url(db);
    let mut conn = PgConnection::establish(&url).map_err(MigrationError::FailedToConnectToDatabase)?;

    info!("acquiring migrations lock");
    diesel::sql_query("select pg_advisory_lock($1);")
        .bind::<BigInt, _>(MIGRATION_LOCK_ID)
        .execute(&mut conn)
        .map_err(MigrationError::FailedToAcquireMigrationsLock)?;

    info!("running any pending migrations");
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(MigrationError::FailedToRunMigrations)?;

    let unlock_result = diesel::sql_query("select pg_advisory_unlock($1);")
        .bind::<BigInt, _>(MIGRATION_LOCK_ID)
        .execute(&mut conn);

    if let Err(e) = unlock_result {
        warn!("failed to release migrations lock, it will be released when the connection drops: {e:?}");
    }

    info!("migrations finished");
    Ok(())
}
