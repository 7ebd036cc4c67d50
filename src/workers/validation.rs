//! Validation worker: no browser, one articulum at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::llm::{ListingForReview, ListingValidator};
use crate::models::{ClaimedArticulum, ValidationStage};
use crate::repository::DbContext;
use crate::validation::{
    ai_stage_verdicts, apply_verdicts, mechanical_filter, price_filter, MechanicalConfig,
    StopwordMatcher,
};

/// Exit code for a worker that gave up after repeated AI failures; the
/// supervisor does not restart such a worker.
pub const AI_FAILURE_EXIT_CODE: i32 = 2;

const IDLE_SLEEP: Duration = Duration::from_secs(10);
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Consecutive AI failures tracked across articulums. Any success
/// resets the streak; the third failure in a row shuts the worker down
/// so the supervisor can decide.
#[derive(Debug, Default)]
struct AiFailureStreak {
    count: u32,
}

impl AiFailureStreak {
    const LIMIT: u32 = 3;

    fn record_success(&mut self) {
        self.count = 0;
    }

    /// Returns true when the streak has reached the shutdown limit.
    fn record_failure(&mut self) -> bool {
        self.count += 1;
        self.count >= Self::LIMIT
    }
}

pub struct ValidationWorker {
    worker_id: String,
    db: DbContext,
    validator: Option<Arc<dyn ListingValidator>>,
    settings: Arc<Settings>,
    stopwords: StopwordMatcher,
    shutdown: CancellationToken,
    ai_failures: AiFailureStreak,
}

impl ValidationWorker {
    pub fn new(
        worker_id: String,
        db: DbContext,
        validator: Option<Arc<dyn ListingValidator>>,
        settings: Arc<Settings>,
        shutdown: CancellationToken,
    ) -> Self {
        let stopwords = StopwordMatcher::new(&settings.stopwords);
        Self {
            worker_id,
            db,
            validator,
            settings,
            stopwords,
            shutdown,
            ai_failures: AiFailureStreak::default(),
        }
    }

    /// Main loop. Returns the exit code for the supervisor.
    pub async fn run(mut self) -> i32 {
        info!(worker_id = %self.worker_id, "validation worker started");
        if self.settings.enable_ai_validation && self.validator.is_none() {
            warn!(worker_id = %self.worker_id, "AI validation enabled but no validator configured");
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.db.articulums().claim_for_validation().await {
                Ok(Some(articulum)) => {
                    if let Err(e) = self.validate_articulum(&articulum).await {
                        error!(
                            worker_id = %self.worker_id,
                            articulum_id = articulum.id,
                            error = %e,
                            "articulum validation failed"
                        );
                    }
                    if self.ai_failures.count >= AiFailureStreak::LIMIT {
                        error!(
                            worker_id = %self.worker_id,
                            "shutting down after {} consecutive AI failures",
                            self.ai_failures.count
                        );
                        return AI_FAILURE_EXIT_CODE;
                    }
                }
                Ok(None) => self.pause(IDLE_SLEEP).await,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "claim failed");
                    self.pause(ERROR_SLEEP).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "validation worker stopped");
        0
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Run all enabled stages for one claimed articulum. Each stage
    /// records one result row per item; survivor counts are checked
    /// after every stage so hopeless articulums are rejected early.
    async fn validate_articulum(&mut self, claimed: &ClaimedArticulum) -> anyhow::Result<()> {
        let articulum_id = claimed.id;
        let min_items = self.settings.min_validated_items;
        info!(articulum_id, articulum = %claimed.articulum, "validating articulum");

        let listings = self
            .db
            .listings()
            .listings_for_articulum(articulum_id)
            .await?;
        info!(articulum_id, listings = listings.len(), "loaded catalog listings");

        if listings.len() < min_items {
            self.db
                .articulums()
                .reject(
                    articulum_id,
                    &format!("fewer than {min_items} listings after catalog parse"),
                )
                .await?;
            return Ok(());
        }

        // Stage 1: price floor.
        let verdicts = price_filter(&listings, self.settings.min_price);
        self.db
            .validation()
            .record_stage(articulum_id, ValidationStage::PriceFilter, &verdicts)
            .await?;
        let listings = apply_verdicts(listings, &verdicts);
        if listings.len() < min_items {
            self.db
                .articulums()
                .reject(
                    articulum_id,
                    &format!("fewer than {min_items} listings after price filter"),
                )
                .await?;
            return Ok(());
        }

        // Stage 2: mechanical checks.
        let config = MechanicalConfig {
            require_articulum_in_text: self.settings.require_articulum_in_text,
            min_seller_reviews: self.settings.min_seller_reviews,
            enable_price_validation: self.settings.enable_price_validation,
        };
        let verdicts = mechanical_filter(&claimed.articulum, &listings, &self.stopwords, &config);
        self.db
            .validation()
            .record_stage(articulum_id, ValidationStage::Mechanical, &verdicts)
            .await?;
        let mut listings = apply_verdicts(listings, &verdicts);
        if listings.len() < min_items {
            self.db
                .articulums()
                .reject(
                    articulum_id,
                    &format!("fewer than {min_items} listings after mechanical validation"),
                )
                .await?;
            return Ok(());
        }

        // Stage 3: AI review, one call per articulum.
        if self.settings.enable_ai_validation {
            if let Some(validator) = self.validator.clone() {
                let reviews: Vec<ListingForReview> = listings
                    .iter()
                    .map(|l| {
                        ListingForReview::new(
                            &l.avito_item_id,
                            &l.title,
                            l.snippet_text.as_deref(),
                            l.price,
                        )
                    })
                    .collect();

                match validator.validate(&claimed.articulum, &reviews).await {
                    Ok(ai_verdict) => {
                        self.ai_failures.record_success();
                        let verdicts = ai_stage_verdicts(&listings, &ai_verdict);
                        self.db
                            .validation()
                            .record_stage(articulum_id, ValidationStage::Ai, &verdicts)
                            .await?;
                        listings = apply_verdicts(listings, &verdicts);
                        if listings.len() < min_items {
                            self.db
                                .articulums()
                                .reject(
                                    articulum_id,
                                    &format!(
                                        "fewer than {min_items} listings after AI validation"
                                    ),
                                )
                                .await?;
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        // Not an item-level rejection: wipe this run's
                        // results and put the articulum back so it is
                        // validated from scratch once the endpoint
                        // recovers.
                        let shutdown = self.ai_failures.record_failure();
                        error!(
                            articulum_id,
                            failures = self.ai_failures.count,
                            error = %e,
                            "AI validation unavailable, rolling articulum back"
                        );
                        self.db
                            .articulums()
                            .rollback_to_catalog_parsed(articulum_id)
                            .await?;
                        if shutdown {
                            warn!(articulum_id, "AI failure limit reached");
                        }
                        return Ok(());
                    }
                }
            }
        }

        let survivor_ids: Vec<String> =
            listings.iter().map(|l| l.avito_item_id.clone()).collect();
        let created = self
            .db
            .articulums()
            .finalize_validated(
                articulum_id,
                &survivor_ids,
                !self.settings.skip_object_parsing,
            )
            .await?;
        info!(
            articulum_id,
            survivors = survivor_ids.len(),
            object_tasks = created,
            "articulum validated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_consecutive_failure_trips_the_streak() {
        let mut streak = AiFailureStreak::default();
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        assert!(streak.record_failure());
    }

    #[test]
    fn any_success_resets_the_streak() {
        let mut streak = AiFailureStreak::default();
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        streak.record_success();
        assert!(!streak.record_failure());
        assert!(!streak.record_failure());
        assert!(streak.record_failure());
    }
}
