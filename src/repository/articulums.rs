//! Articulum state machine.
//!
//! Every lifecycle mutation is a single conditional update: "set state to
//! T where id = X and state = S". Zero affected rows means another worker
//! won the race and the caller abandons the operation. There is no
//! read-then-write anywhere.

use chrono::Utc;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::{debug, info};

use crate::models::{ArticulumState, ClaimedArticulum, TaskStatus};
use crate::schema::{articulums, object_tasks, validation_results};

use super::pool::{DbError, PgPool};
use super::util::to_db_error;

/// Conditional state flip shared by the forward API and the recovery
/// paths. Returns whether exactly one row changed.
pub(super) async fn set_state_where<C>(
    conn: &mut C,
    articulum_id: i64,
    from: ArticulumState,
    to: ArticulumState,
) -> Result<bool, DbError>
where
    C: AsyncConnection<Backend = Pg>,
{
    let now = Utc::now();
    let updated = diesel::update(
        articulums::table
            .filter(articulums::id.eq(articulum_id))
            .filter(articulums::state.eq(from.as_str())),
    )
    .set((
        articulums::state.eq(to.as_str()),
        articulums::state_updated_at.eq(now),
        articulums::updated_at.eq(now),
    ))
    .execute(conn)
    .await?;
    Ok(updated == 1)
}

#[derive(Clone)]
pub struct ArticulumRepository {
    pool: PgPool,
}

impl ArticulumRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert part numbers in state `NEW`, skipping ones already known.
    pub async fn insert_batch(&self, parts: &[String]) -> Result<usize, DbError> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<_> = parts
            .iter()
            .map(|p| articulums::articulum.eq(p.as_str()))
            .collect();
        diesel::insert_into(articulums::table)
            .values(&rows)
            .on_conflict(articulums::articulum)
            .do_nothing()
            .execute(&mut conn)
            .await
    }

    /// Atomic `from -> to` along a forward edge of the lifecycle graph.
    ///
    /// Returns `Ok(false)` on a lost race (the articulum is already in a
    /// different state); the caller treats that as a no-op.
    pub async fn transition(
        &self,
        articulum_id: i64,
        from: ArticulumState,
        to: ArticulumState,
    ) -> Result<bool, DbError> {
        if from.is_terminal() {
            return Err(to_db_error(format!(
                "transition out of terminal state {from} is forbidden"
            )));
        }
        if !from.can_transition_to(to) {
            return Err(to_db_error(format!(
                "illegal articulum transition {from} -> {to}"
            )));
        }
        let mut conn = self.pool.get().await?;
        let moved = set_state_where(&mut conn, articulum_id, from, to).await?;
        if moved {
            debug!(articulum_id, %from, %to, "articulum transitioned");
        } else {
            debug!(articulum_id, %from, %to, "transition skipped, state changed underneath");
        }
        Ok(moved)
    }

    /// Atomically claim the oldest `CATALOG_PARSED` articulum for
    /// validation, moving it to `VALIDATING` in the same transaction.
    pub async fn claim_for_validation(&self) -> Result<Option<ClaimedArticulum>, DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let candidate: Option<i64> = articulums::table
                    .filter(articulums::state.eq(ArticulumState::CatalogParsed.as_str()))
                    .order(articulums::state_updated_at.asc())
                    .select(articulums::id)
                    .limit(1)
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .await
                    .optional()?;

                let Some(id) = candidate else {
                    return Ok(None);
                };

                let now = Utc::now();
                let (id, articulum): (i64, String) =
                    diesel::update(articulums::table.filter(articulums::id.eq(id)))
                        .set((
                            articulums::state.eq(ArticulumState::Validating.as_str()),
                            articulums::state_updated_at.eq(now),
                            articulums::updated_at.eq(now),
                        ))
                        .returning((articulums::id, articulums::articulum))
                        .get_result(conn)
                        .await?;

                Ok(Some(ClaimedArticulum { id, articulum }))
            }
            .scope_boxed()
        })
        .await
    }

    /// `VALIDATING -> REJECTED_BY_MIN_COUNT` (terminal).
    pub async fn reject(&self, articulum_id: i64, reason: &str) -> Result<bool, DbError> {
        let rejected = self
            .transition(
                articulum_id,
                ArticulumState::Validating,
                ArticulumState::RejectedByMinCount,
            )
            .await?;
        if rejected {
            info!(articulum_id, reason, "articulum rejected");
        }
        Ok(rejected)
    }

    /// `VALIDATING -> CATALOG_PARSED` plus deletion of all validation
    /// results for the articulum, in one transaction. Used when the AI
    /// stage is unavailable so the articulum re-enters validation from
    /// scratch later.
    pub async fn rollback_to_catalog_parsed(&self, articulum_id: i64) -> Result<bool, DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let rolled = set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::Validating,
                    ArticulumState::CatalogParsed,
                )
                .await?;
                if rolled {
                    diesel::delete(
                        validation_results::table
                            .filter(validation_results::articulum_id.eq(articulum_id)),
                    )
                    .execute(conn)
                    .await?;
                    info!(articulum_id, "articulum rolled back to CATALOG_PARSED");
                }
                Ok(rolled)
            }
            .scope_boxed()
        })
        .await
    }

    /// `VALIDATING -> VALIDATED` and, unless object parsing is skipped,
    /// one pending object task per surviving listing — all in one
    /// transaction. Returns the number of tasks created (0 when the
    /// transition lost its race).
    pub async fn finalize_validated(
        &self,
        articulum_id: i64,
        survivors: &[String],
        create_object_tasks: bool,
    ) -> Result<usize, DbError> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, DbError, _>(|conn| {
            async move {
                let advanced = set_state_where(
                    conn,
                    articulum_id,
                    ArticulumState::Validating,
                    ArticulumState::Validated,
                )
                .await?;
                if !advanced || !create_object_tasks || survivors.is_empty() {
                    return Ok(0);
                }

                let rows: Vec<_> = survivors
                    .iter()
                    .map(|item_id| {
                        (
                            object_tasks::articulum_id.eq(articulum_id),
                            object_tasks::avito_item_id.eq(item_id.as_str()),
                            object_tasks::status.eq(TaskStatus::Pending.as_str()),
                        )
                    })
                    .collect();

                // The partial unique index on live tasks absorbs repeats.
                let created = diesel::insert_into(object_tasks::table)
                    .values(&rows)
                    .on_conflict_do_nothing()
                    .execute(conn)
                    .await?;
                Ok(created)
            }
            .scope_boxed()
        })
        .await
    }

    /// Articulum counts per state, for the status command.
    pub async fn counts_by_state(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut conn = self.pool.get().await?;
        articulums::table
            .group_by(articulums::state)
            .select((articulums::state, diesel::dsl::count_star()))
            .order(articulums::state.asc())
            .load(&mut conn)
            .await
    }
}
