use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use pumpflow_support::config::DbConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Builds a `postgres://` connection string for `db`.
///
/// `dsn_write` (falling back to `dsn_read`) takes priority when present,
/// exactly as the system this was distilled from prioritizes an explicit
/// DSN over host/name/user composition. Otherwise the URL is assembled
/// from `db.host`/`db.name`/`db.user` plus a password sourced from
/// `POSTGRES_PASSWORD` or `POSTGRES_PASSWORD_FILE` — credentials are
/// deliberately kept out of `DbConfig` itself, since that struct may be
/// serialized into `env.json`.
pub fn postgres_url(db: &DbConfig) -> String {
    if let Some(dsn) = db.dsn_write.as_ref().or(db.dsn_read.as_ref()) {
        return dsn.clone();
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct PostgresCredentials {
        password: Option<String>,
        password_file: Option<PathBuf>,
    }
    let provider = figment::providers::Env::prefixed("POSTGRES_");
    let creds: PostgresCredentials = figment::Figment::from(provider)
        .extract()
        .expect("POSTGRES_PASSWORD or POSTGRES_PASSWORD_FILE must be set when db.dsn_write/dsn_read are unset");

    let password = if let Some(password) = creds.password {
        password
    } else if let Some(password_file) = creds.password_file {
        std::fs::read_to_string(password_file).expect("failed to read postgres password file")
    } else {
        panic!("one of POSTGRES_PASSWORD or POSTGRES_PASSWORD_FILE must be provided");
    };

    // A trailing newline is such a common artifact of `echo`-into-a-file
    // secret provisioning that we trim exactly one. Any other embedded
    // newline is rejected outright rather than silently truncated.
    let password = password.strip_suffix('\n').unwrap_or(&password);
    if password.contains('\n') {
        panic!(
            "postgres password contains a non-terminal newline; refusing to truncate it silently"
        );
    }

    let password = utf8_percent_encode(password, NON_ALPHANUMERIC);

    format!("postgres://{}:{}@{}/{}", db.user, password, db.host, db.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_write_takes_priority_over_composed_url() {
        let mut db = DbConfig::default();
        db.dsn_write = Some("postgres://explicit/dsn".into());
        assert_eq!(postgres_url(&db), "postgres://explicit/dsn");
    }

    #[test]
    fn dsn_read_is_used_when_dsn_write_absent() {
        let mut db = DbConfig::default();
        db.dsn_read = Some("postgres://read-replica/dsn".into());
        assert_eq!(postgres_url(&db), "postgres://read-replica/dsn");
    }
}
