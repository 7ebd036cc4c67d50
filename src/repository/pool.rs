//! PostgreSQL connection pool built on diesel-async + deadpool.

use std::time::Duration;

use diesel_async::pooled_connection::deadpool::{Object, Pool as DeadPool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use tracing::warn;

use super::util::to_db_error;

/// Diesel error type alias. Pool-level failures are folded into the same
/// type so repository signatures stay uniform.
pub type DbError = diesel::result::Error;

/// A pooled async PostgreSQL connection.
pub type PgConn = Object<AsyncPgConnection>;

const DEFAULT_POOL_SIZE: usize = 10;

/// Checkout retry schedule for transient pool/connection failures.
const CHECKOUT_BACKOFF: &[Duration] = &[
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// PostgreSQL connection pool. One instance per process, cloned freely.
#[derive(Clone)]
pub struct PgPool {
    pool: DeadPool<AsyncPgConnection>,
}

impl PgPool {
    /// Create a new pool for the given database URL.
    pub fn new(database_url: &str) -> Result<Self, DbError> {
        Self::with_size(database_url, DEFAULT_POOL_SIZE)
    }

    /// Create a new pool with an explicit size.
    pub fn with_size(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = DeadPool::builder(config)
            .max_size(max_size)
            .build()
            .map_err(to_db_error)?;
        Ok(Self { pool })
    }

    /// Get a connection, retrying transient checkout failures with
    /// exponential backoff. A failure after the last attempt is surfaced
    /// to the caller (and ultimately crashes the worker, which the
    /// supervisor restarts).
    pub async fn get(&self) -> Result<PgConn, DbError> {
        for (attempt, delay) in CHECKOUT_BACKOFF.iter().enumerate() {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "database checkout failed, retrying");
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        self.pool.get().await.map_err(to_db_error)
    }
}
