//! Proxy pool arbitration.
//!
//! Error policy ("three strikes"): transient failures increment a
//! server-side counter and put the proxy back in the pool; the third
//! consecutive error converts to a permanent block. Permanent faults
//! (403 / 407 / tunnel failure) block immediately. Any successful task
//! resets the counter. There is no unblock path.

use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Proxy;
use crate::schema::proxies;

use super::pool::{DbError, PgPool};

/// Consecutive transient errors that convert into a permanent block.
const MAX_CONSECUTIVE_ERRORS: i32 = 3;

/// Poll cadence inside `acquire_with_wait`.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProxyPoolError {
    #[error("no free proxy after waiting {0:?}")]
    NoProxyAvailable(Duration),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Pool counters for the status command.
#[derive(Debug, Clone, Copy)]
pub struct ProxyStats {
    pub total: i64,
    pub blocked: i64,
    pub in_use: i64,
    pub available: i64,
}

/// One proxy definition for loading into the pool.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load proxies into the pool, skipping known host:port pairs.
    pub async fn insert_batch(&self, entries: &[ProxyEntry]) -> Result<usize, DbError> {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| {
                (
                    proxies::host.eq(e.host.as_str()),
                    proxies::port.eq(e.port),
                    proxies::username.eq(e.username.as_deref()),
                    proxies::password.eq(e.password.as_deref()),
                )
            })
            .collect();
        let mut conn = self.pool.get().await?;
        diesel::insert_into(proxies::table)
            .values(&rows)
            .on_conflict((proxies::host, proxies::port))
            .do_nothing()
            .execute(&mut conn)
            .await
    }

    /// Atomically claim one free, unblocked proxy for a worker.
    pub async fn acquire(&self, worker_id: &str) -> Result<Option<Proxy>, DbError> {
        let worker_id = worker_id.to_string();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let candidate: Option<(
                    i64,
                    String,
                    i32,
                    Option<String>,
                    Option<String>,
                    i32,
                )> = proxies::table
                    .filter(proxies::is_blocked.eq(false))
                    .filter(proxies::is_in_use.eq(false))
                    .order(proxies::id.asc())
                    .select((
                        proxies::id,
                        proxies::host,
                        proxies::port,
                        proxies::username,
                        proxies::password,
                        proxies::consecutive_errors,
                    ))
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .await
                    .optional()?;

                let Some((id, host, port, username, password, consecutive_errors)) = candidate
                else {
                    return Ok(None);
                };

                diesel::update(proxies::table.filter(proxies::id.eq(id)))
                    .set((
                        proxies::is_in_use.eq(true),
                        proxies::worker_id.eq(worker_id.as_str()),
                        proxies::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                Ok(Some(Proxy {
                    id,
                    host,
                    port,
                    username,
                    password,
                    consecutive_errors,
                }))
            }
            .scope_boxed()
        })
        .await
    }

    /// Claim a proxy, polling until one frees up or the timeout elapses.
    pub async fn acquire_with_wait(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Proxy, ProxyPoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(proxy) = self.acquire(worker_id).await? {
                return Ok(proxy);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyPoolError::NoProxyAvailable(timeout));
            }
            info!(worker_id, "no free proxy, waiting");
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Return a proxy to the pool. Blocked proxies are left alone.
    pub async fn release(&self, proxy_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            proxies::table
                .filter(proxies::id.eq(proxy_id))
                .filter(proxies::is_blocked.eq(false)),
        )
        .set((
            proxies::is_in_use.eq(false),
            proxies::worker_id.eq(None::<String>),
            proxies::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    /// Permanently block a proxy. There is no unblock path.
    pub async fn block(&self, proxy_id: i64, reason: &str) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(proxies::table.filter(proxies::id.eq(proxy_id)))
            .set((
                proxies::is_blocked.eq(true),
                proxies::is_in_use.eq(false),
                proxies::worker_id.eq(None::<String>),
                proxies::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        warn!(proxy_id, reason, "proxy permanently blocked");
        Ok(())
    }

    /// Record a transient error. The counter lives in the database so it
    /// survives worker restarts; the third strike blocks the proxy for
    /// good, otherwise the proxy goes back to the pool.
    pub async fn increment_error(&self, proxy_id: i64, description: &str) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        let new_errors = conn
            .transaction::<_, DbError, _>(|conn| {
                async move {
                    let current: i32 = proxies::table
                        .filter(proxies::id.eq(proxy_id))
                        .select(proxies::consecutive_errors)
                        .for_update()
                        .first(conn)
                        .await?;
                    let new_errors = current + 1;
                    let now = Utc::now();

                    if new_errors >= MAX_CONSECUTIVE_ERRORS {
                        diesel::update(proxies::table.filter(proxies::id.eq(proxy_id)))
                            .set((
                                proxies::is_blocked.eq(true),
                                proxies::is_in_use.eq(false),
                                proxies::worker_id.eq(None::<String>),
                                proxies::consecutive_errors.eq(new_errors),
                                proxies::last_error_at.eq(now),
                                proxies::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                    } else {
                        diesel::update(proxies::table.filter(proxies::id.eq(proxy_id)))
                            .set((
                                proxies::is_in_use.eq(false),
                                proxies::worker_id.eq(None::<String>),
                                proxies::consecutive_errors.eq(new_errors),
                                proxies::last_error_at.eq(now),
                                proxies::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    Ok(new_errors)
                }
                .scope_boxed()
            })
            .await?;

        if new_errors >= MAX_CONSECUTIVE_ERRORS {
            warn!(
                proxy_id,
                errors = new_errors,
                description,
                "proxy blocked after consecutive errors"
            );
        } else {
            warn!(
                proxy_id,
                errors = new_errors,
                limit = MAX_CONSECUTIVE_ERRORS,
                description,
                "transient proxy error"
            );
        }
        Ok(())
    }

    /// Clear the error counter after a successful task.
    pub async fn reset_errors(&self, proxy_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(proxies::table.filter(proxies::id.eq(proxy_id)))
            .set((
                proxies::consecutive_errors.eq(0),
                proxies::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Pool counters for the status command.
    pub async fn stats(&self) -> Result<ProxyStats, DbError> {
        let mut conn = self.pool.get().await?;
        let total: i64 = proxies::table.count().get_result(&mut conn).await?;
        let blocked: i64 = proxies::table
            .filter(proxies::is_blocked.eq(true))
            .count()
            .get_result(&mut conn)
            .await?;
        let in_use: i64 = proxies::table
            .filter(proxies::is_in_use.eq(true))
            .count()
            .get_result(&mut conn)
            .await?;
        let available: i64 = proxies::table
            .filter(proxies::is_blocked.eq(false))
            .filter(proxies::is_in_use.eq(false))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(ProxyStats {
            total,
            blocked,
            in_use,
            available,
        })
    }
}
