//! Browser worker: one Chromium, one claimed proxy, one page.
//!
//! The loop picks a queue by the buffer heuristic, claims a task and
//! settles it on every path: complete, fail, invalidate, or back to the
//! queue. A task that cannot be settled (process death) is recovered by
//! the heartbeat sweep — nothing here depends on in-process cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{
    BrowserSession, CardStatus, CatalogRequest, CatalogStatus, DriverError, ListingDriver,
};
use crate::config::Settings;
use crate::models::{
    ArticulumState, CatalogListing, ClaimedCatalogTask, ClaimedObjectTask, ObjectDataRecord,
};
use crate::repository::DbContext;

use super::{spawn_heartbeat, TaskKind};

const IDLE_SLEEP: Duration = Duration::from_secs(5);
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Unrecognized-page retries per task before it is failed.
const WRONG_PAGE_LIMIT: u32 = 3;

/// Which queue to try first this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuePreference {
    Catalog,
    Object,
}

/// Below the buffer threshold the fleet refills the buffer (catalog
/// work); at or above it, it drains the buffer (object work).
fn queue_preference(buffer: i64, buffer_size: i64) -> QueuePreference {
    if buffer < buffer_size {
        QueuePreference::Catalog
    } else {
        QueuePreference::Object
    }
}

/// Spellings of the used-goods condition sellers put in characteristics.
const USED_CONDITION_VARIANTS: &[&str] = &[
    "б/у", "бу", "б у", "б.у.", "б.у", "б/у.", "б./у.", "б./у", "б /у",
];

const CONDITION_KEYS: &[&str] = &["состояние", "condition", "статус", "status"];

/// Whether the characteristics declare the item as used goods.
fn is_used_condition(characteristics: &BTreeMap<String, String>) -> bool {
    characteristics.iter().any(|(key, value)| {
        let key = key.to_lowercase();
        if !CONDITION_KEYS.iter().any(|ck| key.contains(ck)) {
            return false;
        }
        let value = value.to_lowercase();
        USED_CONDITION_VARIANTS.iter().any(|v| value.contains(v))
    })
}

pub struct BrowserWorker {
    worker_id: String,
    db: DbContext,
    driver: Arc<dyn ListingDriver>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
    session: Option<BrowserSession>,
}

impl BrowserWorker {
    pub fn new(
        worker_id: String,
        db: DbContext,
        driver: Arc<dyn ListingDriver>,
        settings: Arc<Settings>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            db,
            driver,
            settings,
            shutdown,
            session: None,
        }
    }

    /// Main loop. Returns the exit code for the supervisor.
    pub async fn run(mut self) -> i32 {
        info!(worker_id = %self.worker_id, "browser worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.iterate().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker_id = %self.worker_id, "no tasks available");
                    self.pause(IDLE_SLEEP).await;
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "worker iteration failed");
                    self.pause(ERROR_SLEEP).await;
                }
            }
        }
        self.cleanup().await;
        info!(worker_id = %self.worker_id, "browser worker stopped");
        0
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// One scheduling decision: pick the preferred queue, fall back to
    /// the other, report whether any task was processed.
    async fn iterate(&mut self) -> anyhow::Result<bool> {
        let buffer = self.db.object_tasks().catalog_buffer().await?;
        let prefer = queue_preference(buffer, self.settings.catalog_buffer_size);
        debug!(buffer, limit = self.settings.catalog_buffer_size, ?prefer, "queue preference");

        let order = match prefer {
            QueuePreference::Catalog => [QueuePreference::Catalog, QueuePreference::Object],
            QueuePreference::Object => [QueuePreference::Object, QueuePreference::Catalog],
        };

        for queue in order {
            match queue {
                QueuePreference::Catalog if !self.settings.reparse_mode => {
                    if let Some(task) = self.db.catalog_tasks().claim(&self.worker_id).await? {
                        self.process_catalog_task(task).await;
                        return Ok(true);
                    }
                }
                QueuePreference::Object if !self.settings.skip_object_parsing => {
                    if let Some(task) = self.db.object_tasks().claim(&self.worker_id).await? {
                        self.process_object_task(task).await;
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    async fn process_catalog_task(&mut self, task: ClaimedCatalogTask) {
        info!(
            task_id = task.id,
            articulum = %task.articulum,
            checkpoint = task.checkpoint_page,
            "processing catalog task"
        );
        let heartbeat = spawn_heartbeat(
            self.db.clone(),
            TaskKind::Catalog,
            task.id,
            self.settings.heartbeat_update_interval,
        );

        let result = self.run_catalog_task(&task).await;
        heartbeat.abort();

        if let Err(e) = result {
            warn!(task_id = task.id, error = %e, "catalog task errored, returning to queue");
            if let Err(e) = self
                .db
                .catalog_tasks()
                .return_to_queue(task.id, task.articulum_id)
                .await
            {
                error!(task_id = task.id, error = %e, "failed to return catalog task");
            }
        }
    }

    /// Drive one catalog task to a settled status. Every `Ok(())` path
    /// has already settled the task row.
    async fn run_catalog_task(&mut self, task: &ClaimedCatalogTask) -> anyhow::Result<()> {
        let mut checkpoint = task.checkpoint_page;
        let mut rotations = 0u32;
        let mut wrong_pages = 0u32;

        loop {
            if let Err(e) = self.ensure_session().await {
                warn!(task_id = task.id, error = %e, "no browser session available");
                self.db
                    .catalog_tasks()
                    .return_to_queue(task.id, task.articulum_id)
                    .await?;
                return Ok(());
            }
            let Some(session) = self.session.as_ref() else {
                anyhow::bail!("browser session missing after launch");
            };

            let request = CatalogRequest {
                query: task.articulum.clone(),
                start_page: checkpoint,
                max_pages: self.settings.catalog_max_pages,
            };

            let outcome = match self.driver.parse_catalog(session, &request).await {
                Ok(outcome) => outcome,
                Err(DriverError::ProxyFault(msg)) => {
                    self.block_and_drop(&msg).await?;
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
                Err(DriverError::Transient(msg)) => {
                    self.strike_and_drop(&msg).await?;
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
                Err(DriverError::Other(msg)) => {
                    warn!(task_id = task.id, error = %msg, "unclassified driver error");
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
            };

            // A partial parse moves the resume point forward; persist it
            // so rotation or requeue never redoes finished pages.
            if outcome.resume_page > checkpoint {
                checkpoint = outcome.resume_page;
                self.db
                    .catalog_tasks()
                    .update_checkpoint(task.id, checkpoint)
                    .await?;
            }

            match outcome.status {
                CatalogStatus::Success | CatalogStatus::Empty => {
                    let listings: Vec<CatalogListing> = outcome
                        .listings
                        .into_iter()
                        .map(|l| CatalogListing {
                            articulum_id: task.articulum_id,
                            avito_item_id: l.item_id,
                            title: l.title,
                            price: l.price,
                            snippet_text: l.snippet,
                            seller_name: l.seller_name,
                            seller_id: l.seller_id,
                            seller_rating: l.seller_rating,
                            seller_reviews: l.seller_reviews,
                            image_urls: (!l.image_urls.is_empty()).then_some(l.image_urls),
                        })
                        .collect();

                    if !listings.is_empty() {
                        let stored = self.db.listings().upsert_catalog_listings(&listings).await?;
                        info!(task_id = task.id, stored, "catalog listings stored");
                    } else {
                        info!(task_id = task.id, "catalog empty, no listings stored");
                    }

                    if let Err(e) = self
                        .db
                        .catalog_tasks()
                        .complete(task.id, task.articulum_id)
                        .await
                    {
                        // Articulum left CATALOG_PARSING underneath us;
                        // the heartbeat sweep will reclaim the row.
                        error!(task_id = task.id, error = %e, "catalog completion aborted");
                        return Ok(());
                    }
                    if let Some(proxy_id) = self.current_proxy_id() {
                        self.db.proxies().reset_errors(proxy_id).await?;
                    }
                    return Ok(());
                }
                CatalogStatus::ProxyBlocked | CatalogStatus::ProxyAuthRequired => {
                    rotations += 1;
                    self.block_and_drop("marketplace blocked the proxy").await?;
                    if rotations >= self.settings.proxy_rotation_budget {
                        warn!(
                            task_id = task.id,
                            rotations, "rotation budget exhausted, returning task"
                        );
                        self.db
                            .catalog_tasks()
                            .return_to_queue(task.id, task.articulum_id)
                            .await?;
                        return Ok(());
                    }
                    debug!(task_id = task.id, rotations, checkpoint, "rotating proxy");
                }
                CatalogStatus::CaptchaFailed => {
                    self.release_and_drop().await?;
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
                CatalogStatus::LoadTimeout => {
                    self.strike_and_drop("page load timeout").await?;
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
                CatalogStatus::ServerUnavailable => {
                    // The proxy is fine; the marketplace is not.
                    self.db
                        .catalog_tasks()
                        .return_to_queue(task.id, task.articulum_id)
                        .await?;
                    return Ok(());
                }
                CatalogStatus::PageNotDetected | CatalogStatus::WrongPage => {
                    wrong_pages += 1;
                    if wrong_pages >= WRONG_PAGE_LIMIT {
                        self.db
                            .catalog_tasks()
                            .fail(task.id, task.articulum_id, "unrecognized page layout")
                            .await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn process_object_task(&mut self, task: ClaimedObjectTask) {
        info!(
            task_id = task.id,
            item = %task.avito_item_id,
            "processing object task"
        );

        // The articulum's first claimed object task starts its (terminal)
        // object-parsing phase; later claims are no-ops. Reparse runs
        // against terminal articulums and skips this.
        if !self.settings.reparse_mode {
            if let Err(e) = self
                .db
                .articulums()
                .transition(
                    task.articulum_id,
                    ArticulumState::Validated,
                    ArticulumState::ObjectParsing,
                )
                .await
            {
                error!(task_id = task.id, error = %e, "object-parsing transition failed");
            }
        }

        let heartbeat = spawn_heartbeat(
            self.db.clone(),
            TaskKind::Object,
            task.id,
            self.settings.heartbeat_update_interval,
        );

        let result = self.run_object_task(&task).await;
        heartbeat.abort();

        if let Err(e) = result {
            warn!(task_id = task.id, error = %e, "object task errored, returning to queue");
            if let Err(e) = self.db.object_tasks().return_to_queue(task.id).await {
                error!(task_id = task.id, error = %e, "failed to return object task");
            }
        }
    }

    async fn run_object_task(&mut self, task: &ClaimedObjectTask) -> anyhow::Result<()> {
        let mut server_retries = 0u32;
        let mut wrong_pages = 0u32;

        loop {
            if let Err(e) = self.ensure_session().await {
                warn!(task_id = task.id, error = %e, "no browser session available");
                self.db.object_tasks().return_to_queue(task.id).await?;
                return Ok(());
            }
            let Some(session) = self.session.as_ref() else {
                anyhow::bail!("browser session missing after launch");
            };

            let outcome = match self.driver.parse_card(session, &task.avito_item_id).await {
                Ok(outcome) => outcome,
                Err(DriverError::ProxyFault(msg)) => {
                    self.block_and_drop(&msg).await?;
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
                Err(DriverError::Transient(msg)) => {
                    self.strike_and_drop(&msg).await?;
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
                Err(DriverError::Other(msg)) => {
                    warn!(task_id = task.id, error = %msg, "unclassified driver error");
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
            };

            match outcome.status {
                CardStatus::Success => {
                    let Some(details) = outcome.data else {
                        self.db
                            .object_tasks()
                            .fail(task.id, "card parse returned no payload")
                            .await?;
                        return Ok(());
                    };

                    if is_used_condition(&details.characteristics) {
                        self.db
                            .object_tasks()
                            .invalidate(task.id, "used condition in characteristics")
                            .await?;
                        return Ok(());
                    }

                    let characteristics = (!details.characteristics.is_empty()).then(|| {
                        serde_json::Value::Object(
                            details
                                .characteristics
                                .iter()
                                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                                .collect(),
                        )
                    });
                    let record = ObjectDataRecord {
                        articulum_id: task.articulum_id,
                        avito_item_id: task.avito_item_id.clone(),
                        title: details.title,
                        price: details.price,
                        seller_name: details.seller_name,
                        published_at: details.published_at,
                        description: details.description,
                        location_name: details.location_name,
                        characteristics,
                        views_total: details.views_total,
                        raw_html: details.raw_html,
                    };

                    self.db.listings().insert_object_data(&record).await?;
                    self.db.object_tasks().complete(task.id).await?;
                    if let Some(proxy_id) = self.current_proxy_id() {
                        self.db.proxies().reset_errors(proxy_id).await?;
                    }
                    info!(task_id = task.id, item = %task.avito_item_id, "detail page stored");
                    return Ok(());
                }
                CardStatus::NotFound => {
                    self.db
                        .object_tasks()
                        .invalidate(task.id, "listing removed")
                        .await?;
                    return Ok(());
                }
                CardStatus::ProxyBlocked => {
                    self.block_and_drop("marketplace blocked the proxy").await?;
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
                CardStatus::CaptchaFailed => {
                    self.release_and_drop().await?;
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
                CardStatus::ServerUnavailable => {
                    server_retries += 1;
                    if server_retries <= self.settings.server_error_retry_attempts {
                        debug!(
                            task_id = task.id,
                            attempt = server_retries,
                            "server error, retrying after delay"
                        );
                        tokio::time::sleep(self.settings.server_error_retry_delay).await;
                        continue;
                    }
                    self.db.object_tasks().return_to_queue(task.id).await?;
                    return Ok(());
                }
                CardStatus::PageNotDetected | CardStatus::WrongPage => {
                    wrong_pages += 1;
                    if wrong_pages >= WRONG_PAGE_LIMIT {
                        self.db
                            .object_tasks()
                            .fail(task.id, "unrecognized page layout")
                            .await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Launch a browser on a freshly claimed proxy if none is running.
    async fn ensure_session(&mut self) -> anyhow::Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let proxy = self
            .db
            .proxies()
            .acquire_with_wait(&self.worker_id, self.settings.proxy_wait_timeout)
            .await?;
        match BrowserSession::launch(&proxy).await {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!(proxy_id = proxy.id, error = %e, "browser launch failed");
                if let Err(re) = self.db.proxies().release(proxy.id).await {
                    error!(proxy_id = proxy.id, error = %re, "failed to release proxy");
                }
                Err(e)
            }
        }
    }

    fn current_proxy_id(&self) -> Option<i64> {
        self.session.as_ref().map(|s| s.proxy_id())
    }

    /// Permanently block the session's proxy and tear the browser down.
    async fn block_and_drop(&mut self, reason: &str) -> anyhow::Result<()> {
        if let Some(session) = self.session.take() {
            self.db.proxies().block(session.proxy_id(), reason).await?;
            session.close().await;
        }
        Ok(())
    }

    /// Return the proxy unharmed and tear the browser down.
    async fn release_and_drop(&mut self) -> anyhow::Result<()> {
        if let Some(session) = self.session.take() {
            self.db.proxies().release(session.proxy_id()).await?;
            session.close().await;
        }
        Ok(())
    }

    /// Give the proxy a strike (third strike blocks it) and tear the
    /// browser down.
    async fn strike_and_drop(&mut self, description: &str) -> anyhow::Result<()> {
        if let Some(session) = self.session.take() {
            self.db
                .proxies()
                .increment_error(session.proxy_id(), description)
                .await?;
            session.close().await;
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.db.proxies().release(session.proxy_id()).await {
                error!(error = %e, "failed to release proxy during shutdown");
            }
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_below_threshold_prefers_catalog() {
        assert_eq!(queue_preference(0, 5), QueuePreference::Catalog);
        assert_eq!(queue_preference(4, 5), QueuePreference::Catalog);
        assert_eq!(queue_preference(5, 5), QueuePreference::Object);
        assert_eq!(queue_preference(12, 5), QueuePreference::Object);
    }

    #[test]
    fn used_condition_is_detected_in_condition_keys_only() {
        let mut chars = BTreeMap::new();
        chars.insert("Состояние".to_string(), "Б/у".to_string());
        assert!(is_used_condition(&chars));

        let mut chars = BTreeMap::new();
        chars.insert("Состояние".to_string(), "Новое".to_string());
        assert!(!is_used_condition(&chars));

        // a used-looking token outside a condition key is ignored
        let mut chars = BTreeMap::new();
        chars.insert("Описание".to_string(), "продаю б/у".to_string());
        assert!(!is_used_condition(&chars));

        let mut chars = BTreeMap::new();
        chars.insert("condition".to_string(), "used, worn".to_string());
        assert!(!is_used_condition(&chars));
        chars.insert("Статус".to_string(), "б.у.".to_string());
        assert!(is_used_condition(&chars));
    }
}
