//! Validation result rows.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::models::{StageVerdict, ValidationStage};
use crate::schema::validation_results;

use super::pool::{DbError, PgPool};

#[derive(Clone)]
pub struct ValidationRepository {
    pool: PgPool,
}

impl ValidationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record one stage's verdicts for an articulum, one row per item.
    pub async fn record_stage(
        &self,
        articulum_id: i64,
        stage: ValidationStage,
        verdicts: &[StageVerdict],
    ) -> Result<usize, DbError> {
        if verdicts.is_empty() {
            return Ok(0);
        }
        let rows: Vec<_> = verdicts
            .iter()
            .map(|v| {
                (
                    validation_results::articulum_id.eq(articulum_id),
                    validation_results::avito_item_id.eq(v.avito_item_id.as_str()),
                    validation_results::stage.eq(stage.as_str()),
                    validation_results::passed.eq(v.passed),
                    validation_results::rejection_reason.eq(v.rejection_reason.as_deref()),
                )
            })
            .collect();

        let mut conn = self.pool.get().await?;
        diesel::insert_into(validation_results::table)
            .values(&rows)
            .execute(&mut conn)
            .await
    }
}
