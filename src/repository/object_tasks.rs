//! Object task queue: one task per listing detail page.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::{debug, info, warn};

use crate::models::{ArticulumState, ClaimedObjectTask, TaskStatus};
use crate::schema::{articulums, object_tasks};

use super::pool::{DbError, PgPool};

#[derive(Clone)]
pub struct ObjectTaskRepository {
    pool: PgPool,
}

impl ObjectTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim the oldest pending object task. No articulum predicate: its
    /// articulum is already `VALIDATED` or `OBJECT_PARSING`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedObjectTask>, DbError> {
        let worker_id = worker_id.to_string();
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let candidate: Option<(i64, i64, String)> = object_tasks::table
                    .filter(object_tasks::status.eq(TaskStatus::Pending.as_str()))
                    .order(object_tasks::created_at.asc())
                    .select((
                        object_tasks::id,
                        object_tasks::articulum_id,
                        object_tasks::avito_item_id,
                    ))
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .await
                    .optional()?;

                let Some((task_id, articulum_id, avito_item_id)) = candidate else {
                    return Ok(None);
                };

                let now = Utc::now();
                diesel::update(object_tasks::table.filter(object_tasks::id.eq(task_id)))
                    .set((
                        object_tasks::status.eq(TaskStatus::Processing.as_str()),
                        object_tasks::worker_id.eq(worker_id.as_str()),
                        object_tasks::heartbeat_at.eq(now),
                        object_tasks::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                let articulum: String = articulums::table
                    .filter(articulums::id.eq(articulum_id))
                    .select(articulums::articulum)
                    .first(conn)
                    .await?;

                debug!(task_id, %avito_item_id, "object task claimed");
                Ok(Some(ClaimedObjectTask {
                    id: task_id,
                    articulum_id,
                    articulum,
                    avito_item_id,
                }))
            }
            .scope_boxed()
        })
        .await
    }

    /// Mark the task done. The articulum stays in `OBJECT_PARSING`.
    pub async fn complete(&self, task_id: i64) -> Result<(), DbError> {
        self.set_status(task_id, TaskStatus::Completed).await
    }

    pub async fn fail(&self, task_id: i64, reason: &str) -> Result<(), DbError> {
        self.set_status(task_id, TaskStatus::Failed).await?;
        warn!(task_id, reason, "object task failed");
        Ok(())
    }

    /// Terminal status for listings detected as removed or used goods.
    /// Never retried.
    pub async fn invalidate(&self, task_id: i64, reason: &str) -> Result<(), DbError> {
        self.set_status(task_id, TaskStatus::Invalid).await?;
        info!(task_id, reason, "object task invalidated");
        Ok(())
    }

    /// Put the task back in the queue (pending, no worker).
    pub async fn return_to_queue(&self, task_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(object_tasks::table.filter(object_tasks::id.eq(task_id)))
            .set((
                object_tasks::status.eq(TaskStatus::Pending.as_str()),
                object_tasks::worker_id.eq(None::<String>),
                object_tasks::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Refresh the liveness timestamp of an in-flight task.
    pub async fn heartbeat(&self, task_id: i64) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        diesel::update(object_tasks::table.filter(object_tasks::id.eq(task_id)))
            .set((
                object_tasks::heartbeat_at.eq(now),
                object_tasks::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Scheduling buffer: validated articulums that still have pending
    /// object tasks. Browser workers prefer catalog tasks while this is
    /// below the configured buffer size.
    pub async fn catalog_buffer(&self) -> Result<i64, DbError> {
        use diesel::dsl::exists;

        let mut conn = self.pool.get().await?;
        articulums::table
            .filter(articulums::state.eq(ArticulumState::Validated.as_str()))
            .filter(exists(
                object_tasks::table
                    .filter(object_tasks::articulum_id.eq(articulums::id))
                    .filter(object_tasks::status.eq(TaskStatus::Pending.as_str())),
            ))
            .count()
            .get_result(&mut conn)
            .await
    }

    /// Create object tasks for previously parsed listings that are due
    /// for another pass (reparse mode).
    ///
    /// Scope comes from the reparse filter tables when they are
    /// non-empty, otherwise every listing in `object_data` qualifies. A
    /// listing is due when its newest parse is at least
    /// `min_interval_hours` old and it has no live task.
    pub async fn seed_reparse(&self, min_interval_hours: i64) -> Result<usize, DbError> {
        use crate::schema::{reparse_filter_articulums, reparse_filter_items};
        use diesel::dsl::exists;
        use diesel::BoolExpressionMethods;

        let mut conn = self.pool.get().await?;

        let filters_exist: bool = diesel::select(
            exists(reparse_filter_items::table.select(reparse_filter_items::avito_item_id)).or(
                exists(
                    reparse_filter_articulums::table.select(reparse_filter_articulums::articulum),
                ),
            ),
        )
        .get_result(&mut conn)
        .await?;

        let target_items = if filters_exist {
            r#"SELECT avito_item_id FROM reparse_filter_items
               UNION
               SELECT DISTINCT cl.avito_item_id
               FROM catalog_listings cl
               JOIN articulums a ON a.id = cl.articulum_id
               JOIN reparse_filter_articulums rfa ON rfa.articulum = a.articulum"#
        } else {
            "SELECT DISTINCT avito_item_id FROM object_data"
        };

        let sql = format!(
            r#"WITH target_items AS (
                   {target_items}
               ),
               latest_parses AS (
                   SELECT od.avito_item_id, od.articulum_id, MAX(od.parsed_at) AS last_parsed_at
                   FROM object_data od
                   JOIN target_items ti ON ti.avito_item_id = od.avito_item_id
                   GROUP BY od.avito_item_id, od.articulum_id
                   HAVING EXTRACT(EPOCH FROM (NOW() - MAX(od.parsed_at))) / 3600 >= $1
               ),
               new_tasks AS (
                   INSERT INTO object_tasks (articulum_id, avito_item_id, status)
                   SELECT DISTINCT ON (lp.avito_item_id) lp.articulum_id, lp.avito_item_id, 'pending'
                   FROM latest_parses lp
                   WHERE NOT EXISTS (
                       SELECT 1 FROM object_tasks ot
                       WHERE ot.avito_item_id = lp.avito_item_id
                         AND ot.status IN ('pending', 'processing')
                   )
                   ORDER BY lp.avito_item_id, lp.last_parsed_at ASC
                   RETURNING 1
               )
               SELECT COUNT(*) AS count FROM new_tasks"#
        );

        let row: CountRow = diesel::sql_query(sql)
            .bind::<diesel::sql_types::BigInt, _>(min_interval_hours)
            .get_result(&mut conn)
            .await?;
        Ok(row.count as usize)
    }

    /// Queue depth per status, for the status command.
    pub async fn counts_by_status(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut conn = self.pool.get().await?;
        object_tasks::table
            .group_by(object_tasks::status)
            .select((object_tasks::status, diesel::dsl::count_star()))
            .order(object_tasks::status.asc())
            .load(&mut conn)
            .await
    }

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        diesel::update(object_tasks::table.filter(object_tasks::id.eq(task_id)))
            .set((
                object_tasks::status.eq(status.as_str()),
                object_tasks::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(diesel::QueryableByName)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    count: i64,
}
