//! Heartbeat recovery: the sole crash-recovery mechanism.
//!
//! A worker that dies mid-task leaves a `processing` row whose heartbeat
//! goes stale. The sweep returns such tasks (and their proxies) to the
//! pools and rolls articulum state back to the pre-claim value. Worker
//! crashes need no in-process cleanup beyond this.

use std::time::Duration;

use chrono::Utc;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::warn;

use crate::models::{ArticulumState, TaskStatus};
use crate::schema::{articulums, catalog_tasks, object_tasks, proxies};

use super::articulums::set_state_where;
use super::pool::{DbError, PgPool};
use super::util::to_db_error;

/// What one sweep pass put back.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub orphans_fixed: usize,
    pub catalog_returned: usize,
    pub object_returned: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.orphans_fixed + self.catalog_returned + self.object_returned
    }
}

/// Resources reclaimed from one dead worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerCleanup {
    pub proxies_released: usize,
    pub catalog_tasks_returned: usize,
    pub object_tasks_returned: usize,
}

async fn release_worker_proxies<C>(conn: &mut C, worker_id: &str) -> Result<usize, DbError>
where
    C: AsyncConnection<Backend = Pg>,
{
    diesel::update(
        proxies::table
            .filter(proxies::worker_id.eq(worker_id))
            .filter(proxies::is_in_use.eq(true)),
    )
    .set((
        proxies::is_in_use.eq(false),
        proxies::worker_id.eq(None::<String>),
        proxies::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await
}

/// One transaction: proxy back to the pool, articulum back to `NEW` (if
/// still mid-parse), task back to pending with its checkpoint intact.
async fn requeue_catalog_task<C>(
    conn: &mut C,
    task_id: i64,
    worker_id: Option<&str>,
    articulum_id: i64,
) -> Result<(), DbError>
where
    C: AsyncConnection<Backend = Pg>,
{
    if let Some(worker_id) = worker_id {
        release_worker_proxies(conn, worker_id).await?;
    }
    set_state_where(
        conn,
        articulum_id,
        ArticulumState::CatalogParsing,
        ArticulumState::New,
    )
    .await?;
    diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
        .set((
            catalog_tasks::status.eq(TaskStatus::Pending.as_str()),
            catalog_tasks::worker_id.eq(None::<String>),
            catalog_tasks::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// One transaction: proxy back, task back to pending, and the articulum
/// regressed `OBJECT_PARSING -> VALIDATED` only when this was its last
/// in-flight object task.
async fn requeue_object_task<C>(
    conn: &mut C,
    task_id: i64,
    worker_id: Option<&str>,
    articulum_id: i64,
) -> Result<(), DbError>
where
    C: AsyncConnection<Backend = Pg>,
{
    if let Some(worker_id) = worker_id {
        release_worker_proxies(conn, worker_id).await?;
    }
    diesel::update(object_tasks::table.filter(object_tasks::id.eq(task_id)))
        .set((
            object_tasks::status.eq(TaskStatus::Pending.as_str()),
            object_tasks::worker_id.eq(None::<String>),
            object_tasks::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    let in_flight: i64 = object_tasks::table
        .filter(object_tasks::articulum_id.eq(articulum_id))
        .filter(object_tasks::status.eq(TaskStatus::Processing.as_str()))
        .count()
        .get_result(conn)
        .await?;
    if in_flight == 0 {
        set_state_where(
            conn,
            articulum_id,
            ArticulumState::ObjectParsing,
            ArticulumState::Validated,
        )
        .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct RecoveryRepository {
    pool: PgPool,
}

impl RecoveryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One full recovery pass: orphan repair, then both task tables.
    pub async fn sweep(&self, heartbeat_timeout: Duration) -> Result<SweepReport, DbError> {
        Ok(SweepReport {
            orphans_fixed: self.repair_orphaned_articulums().await?,
            catalog_returned: self.recover_expired_catalog_tasks(heartbeat_timeout).await?,
            object_returned: self.recover_expired_object_tasks(heartbeat_timeout).await?,
        })
    }

    /// Return catalog tasks whose worker stopped heartbeating.
    pub async fn recover_expired_catalog_tasks(
        &self,
        heartbeat_timeout: Duration,
    ) -> Result<usize, DbError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(heartbeat_timeout).map_err(to_db_error)?;

        let mut conn = self.pool.get().await?;
        let expired: Vec<(i64, Option<String>, i64)> = catalog_tasks::table
            .filter(catalog_tasks::status.eq(TaskStatus::Processing.as_str()))
            .filter(catalog_tasks::heartbeat_at.lt(cutoff))
            .select((
                catalog_tasks::id,
                catalog_tasks::worker_id,
                catalog_tasks::articulum_id,
            ))
            .load(&mut conn)
            .await?;

        for (task_id, worker_id, articulum_id) in &expired {
            let (task_id, articulum_id) = (*task_id, *articulum_id);
            let worker_id = worker_id.clone();
            conn.transaction::<_, DbError, _>(|conn| {
                async move {
                    requeue_catalog_task(conn, task_id, worker_id.as_deref(), articulum_id).await
                }
                .scope_boxed()
            })
            .await?;
            warn!(task_id, articulum_id, "stale catalog task returned to queue");
        }
        Ok(expired.len())
    }

    /// Return object tasks whose worker stopped heartbeating.
    pub async fn recover_expired_object_tasks(
        &self,
        heartbeat_timeout: Duration,
    ) -> Result<usize, DbError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(heartbeat_timeout).map_err(to_db_error)?;

        let mut conn = self.pool.get().await?;
        let expired: Vec<(i64, Option<String>, i64)> = object_tasks::table
            .filter(object_tasks::status.eq(TaskStatus::Processing.as_str()))
            .filter(object_tasks::heartbeat_at.lt(cutoff))
            .select((
                object_tasks::id,
                object_tasks::worker_id,
                object_tasks::articulum_id,
            ))
            .load(&mut conn)
            .await?;

        for (task_id, worker_id, articulum_id) in &expired {
            let (task_id, articulum_id) = (*task_id, *articulum_id);
            let worker_id = worker_id.clone();
            conn.transaction::<_, DbError, _>(|conn| {
                async move {
                    requeue_object_task(conn, task_id, worker_id.as_deref(), articulum_id).await
                }
                .scope_boxed()
            })
            .await?;
            warn!(task_id, articulum_id, "stale object task returned to queue");
        }
        Ok(expired.len())
    }

    /// Articulums stuck in `CATALOG_PARSING` with no live task go back to
    /// `NEW`. Such rows appear when a claim half-applies or a failed
    /// worker never reached the task row.
    pub async fn repair_orphaned_articulums(&self) -> Result<usize, DbError> {
        use diesel::dsl::{exists, not};

        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let fixed = diesel::update(
            articulums::table
                .filter(articulums::state.eq(ArticulumState::CatalogParsing.as_str()))
                .filter(not(exists(
                    catalog_tasks::table
                        .filter(catalog_tasks::articulum_id.eq(articulums::id))
                        .filter(catalog_tasks::status.eq(TaskStatus::Processing.as_str())),
                ))),
        )
        .set((
            articulums::state.eq(ArticulumState::New.as_str()),
            articulums::state_updated_at.eq(now),
            articulums::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        if fixed > 0 {
            warn!(fixed, "orphaned articulums returned to NEW");
        }
        Ok(fixed)
    }

    /// Reclaim everything a dead worker held: its proxy and its
    /// in-flight tasks, through the same per-task transactions the sweep
    /// uses. Called by the supervisor before restarting a worker.
    pub async fn release_worker(&self, worker_id: &str) -> Result<WorkerCleanup, DbError> {
        let mut cleanup = WorkerCleanup::default();
        let mut conn = self.pool.get().await?;

        let catalog: Vec<(i64, i64)> = catalog_tasks::table
            .filter(catalog_tasks::worker_id.eq(worker_id))
            .filter(catalog_tasks::status.eq(TaskStatus::Processing.as_str()))
            .select((catalog_tasks::id, catalog_tasks::articulum_id))
            .load(&mut conn)
            .await?;
        for (task_id, articulum_id) in catalog {
            let worker = worker_id.to_string();
            conn.transaction::<_, DbError, _>(|conn| {
                async move {
                    requeue_catalog_task(conn, task_id, Some(worker.as_str()), articulum_id).await
                }
                .scope_boxed()
            })
            .await?;
            cleanup.catalog_tasks_returned += 1;
        }

        let object: Vec<(i64, i64)> = object_tasks::table
            .filter(object_tasks::worker_id.eq(worker_id))
            .filter(object_tasks::status.eq(TaskStatus::Processing.as_str()))
            .select((object_tasks::id, object_tasks::articulum_id))
            .load(&mut conn)
            .await?;
        for (task_id, articulum_id) in object {
            let worker = worker_id.to_string();
            conn.transaction::<_, DbError, _>(|conn| {
                async move {
                    requeue_object_task(conn, task_id, Some(worker.as_str()), articulum_id).await
                }
                .scope_boxed()
            })
            .await?;
            cleanup.object_tasks_returned += 1;
        }

        cleanup.proxies_released = release_worker_proxies(&mut conn, worker_id).await?;
        Ok(cleanup)
    }
}
