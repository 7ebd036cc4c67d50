//! Catalog task queue: one task per articulum search pass.

use chrono::Utc;
use diesel::prelude::*;
use diesel::IntoSql;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::{debug, warn};

use crate::models::{ArticulumState, ClaimedCatalogTask, TaskStatus};
use crate::schema::{articulums, catalog_tasks};

use super::articulums::set_state_where;
use super::pool::{DbError, PgPool};
use super::util::to_db_error;

#[derive(Clone)]
pub struct CatalogTaskRepository {
    pool: PgPool,
}

impl CatalogTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create pending catalog tasks for `NEW` articulums that have no
    /// live task yet. Batched insert-from-select; the articulum stays in
    /// `NEW` until a worker claims the task.
    pub async fn seed_from_new(&self) -> Result<usize, DbError> {
        use diesel::dsl::{exists, not};

        let mut conn = self.pool.get().await?;
        let source = articulums::table
            .filter(articulums::state.eq(ArticulumState::New.as_str()))
            .filter(not(exists(
                catalog_tasks::table
                    .filter(catalog_tasks::articulum_id.eq(articulums::id))
                    .filter(catalog_tasks::status.eq_any([
                        TaskStatus::Pending.as_str(),
                        TaskStatus::Processing.as_str(),
                    ])),
            )))
            .select((
                articulums::id,
                TaskStatus::Pending
                    .as_str()
                    .into_sql::<diesel::sql_types::Text>(),
                1.into_sql::<diesel::sql_types::Int4>(),
            ));

        source
            .insert_into(catalog_tasks::table)
            .into_columns((
                catalog_tasks::articulum_id,
                catalog_tasks::status,
                catalog_tasks::checkpoint_page,
            ))
            .execute(&mut conn)
            .await
    }

    /// Claim the oldest pending task whose articulum is still `NEW`.
    ///
    /// One transaction: lock the task row (skipping locked ones), move
    /// the articulum `NEW -> CATALOG_PARSING`, mark the task processing
    /// with the worker id and a fresh heartbeat. If the articulum half
    /// fails the whole claim aborts.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedCatalogTask>, DbError> {
        let worker_id = worker_id.to_string();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let candidate: Option<(i64, i64, i32)> = catalog_tasks::table
                    .filter(catalog_tasks::status.eq(TaskStatus::Pending.as_str()))
                    .filter(
                        catalog_tasks::articulum_id.eq_any(
                            articulums::table
                                .filter(articulums::state.eq(ArticulumState::New.as_str()))
                                .select(articulums::id),
                        ),
                    )
                    .order(catalog_tasks::created_at.asc())
                    .select((
                        catalog_tasks::id,
                        catalog_tasks::articulum_id,
                        catalog_tasks::checkpoint_page,
                    ))
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .await
                    .optional()?;

                let Some((task_id, articulum_id, checkpoint_page)) = candidate else {
                    return Ok(None);
                };

                let moved = set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::New,
                    ArticulumState::CatalogParsing,
                )
                .await?;
                if !moved {
                    // Articulum changed underneath; abandon without
                    // touching the task row.
                    return Ok(None);
                }

                let now = Utc::now();
                diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
                    .set((
                        catalog_tasks::status.eq(TaskStatus::Processing.as_str()),
                        catalog_tasks::worker_id.eq(worker_id.as_str()),
                        catalog_tasks::heartbeat_at.eq(now),
                        catalog_tasks::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let articulum: String = articulums::table
                    .filter(articulums::id.eq(articulum_id))
                    .select(articulums::articulum)
                    .first(conn)
                    .await?;

                debug!(task_id, articulum_id, "catalog task claimed");
                Ok(Some(ClaimedCatalogTask {
                    id: task_id,
                    articulum_id,
                    articulum,
                    checkpoint_page,
                }))
            }
            .scope_boxed()
        })
        .await
    }

    /// Mark the task completed and move the articulum
    /// `CATALOG_PARSING -> CATALOG_PARSED` in one transaction.
    ///
    /// If the articulum is no longer in `CATALOG_PARSING` the transaction
    /// rolls back and the error is surfaced; the task stays processing
    /// until heartbeat recovery reclaims it.
    pub async fn complete(&self, task_id: i64, articulum_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let now = Utc::now();
                diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
                    .set((
                        catalog_tasks::status.eq(TaskStatus::Completed.as_str()),
                        catalog_tasks::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let advanced = set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::CatalogParsing,
                    ArticulumState::CatalogParsed,
                )
                .await?;
                if !advanced {
                    return Err(to_db_error(format!(
                        "articulum {articulum_id} left CATALOG_PARSING mid-task"
                    )));
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Mark the task failed and return the articulum to `NEW` so a later
    /// pass can retry it.
    pub async fn fail(&self, task_id: i64, articulum_id: i64, reason: &str) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let now = Utc::now();
                diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
                    .set((
                        catalog_tasks::status.eq(TaskStatus::Failed.as_str()),
                        catalog_tasks::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::CatalogParsing,
                    ArticulumState::New,
                )
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await?;
        warn!(task_id, reason, "catalog task failed");
        Ok(())
    }

    /// Put the task back in the queue (pending, no worker) and roll the
    /// articulum back to `NEW`. The checkpoint page is retained so a
    /// partial parse is not redone.
    pub async fn return_to_queue(&self, task_id: i64, articulum_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let now = Utc::now();
                diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
                    .set((
                        catalog_tasks::status.eq(TaskStatus::Pending.as_str()),
                        catalog_tasks::worker_id.eq(None::<String>),
                        catalog_tasks::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::CatalogParsing,
                    ArticulumState::New,
                )
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Persist the resume page for a partially parsed catalog.
    pub async fn update_checkpoint(&self, task_id: i64, page: i32) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
            .set((
                catalog_tasks::checkpoint_page.eq(page),
                catalog_tasks::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Refresh the liveness timestamp of an in-flight task.
    pub async fn heartbeat(&self, task_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        diesel::update(catalog_tasks::table.filter(catalog_tasks::id.eq(task_id)))
            .set((
                catalog_tasks::heartbeat_at.eq(now),
                catalog_tasks::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Queue depth per status, for the status command.
    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut conn = self.pool.get().await?;
        catalog_tasks::table
            .group_by(catalog_tasks::status)
            .select((catalog_tasks::status, diesel::dsl::count_star()))
            .order(catalog_tasks::status.asc())
            .load(&mut conn)
            .await
    }
}
