//! Orchestrator: worker supervision, task seeding, heartbeat recovery.

mod seeder;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::{ListingDriver, MarketplaceDriver};
use crate::config::Settings;
use crate::llm::{ChatValidator, ListingValidator};
use crate::repository::DbContext;
use crate::workers::{BrowserWorker, ValidationWorker, AI_FAILURE_EXIT_CODE};

use seeder::{recovery_loop, seed_catalog_loop};

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Browser,
    Validation,
}

struct WorkerSlot {
    kind: WorkerKind,
    index: u32,
    worker_id: String,
    /// `None` once the worker is permanently down (AI failure exit).
    handle: Option<JoinHandle<i32>>,
}

/// Parent of the whole pipeline: spawns N browser and M validation
/// workers as supervised tasks, runs the seeding producers and the
/// heartbeat recovery sweep, restarts dead workers after reclaiming
/// their resources, and shuts everything down on SIGINT/SIGTERM.
pub struct Orchestrator {
    db: DbContext,
    settings: Arc<Settings>,
    driver: Arc<dyn ListingDriver>,
    validator: Option<Arc<dyn ListingValidator>>,
}

impl Orchestrator {
    pub fn new(db: DbContext, settings: Settings) -> Self {
        let driver: Arc<dyn ListingDriver> = Arc::new(MarketplaceDriver::new(
            &settings.market_base_url,
            settings.object_include_html,
        ));

        let validator: Option<Arc<dyn ListingValidator>> = if settings.enable_ai_validation {
            match ChatValidator::new(settings.llm.clone()) {
                Ok(v) => Some(Arc::new(v)),
                Err(e) => {
                    warn!(error = %e, "AI validation enabled but validator unavailable");
                    None
                }
            }
        } else {
            None
        };

        Self {
            db,
            settings: Arc::new(settings),
            driver,
            validator,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        self.install_signal_handler(&shutdown);

        info!(
            container = %self.settings.container_id,
            browser_workers = self.settings.total_browser_workers,
            validation_workers = self.settings.total_validation_workers,
            reparse = self.settings.reparse_mode,
            "starting pipeline"
        );

        let sweep = tokio::spawn(recovery_loop(
            self.db.clone(),
            self.settings.clone(),
            shutdown.child_token(),
        ));

        let seeder = if self.settings.reparse_mode {
            // Reparse targets are fully known up front; seed once.
            let db = self.db.clone();
            let hours = self.settings.min_reparse_interval_hours;
            tokio::spawn(async move {
                match db.object_tasks().seed_reparse(hours).await {
                    Ok(0) => warn!("no listings due for reparse"),
                    Ok(created) => info!(created, "seeded reparse object tasks"),
                    Err(e) => error!(error = %e, "reparse seeding failed"),
                }
            })
        } else {
            tokio::spawn(seed_catalog_loop(self.db.clone(), shutdown.child_token()))
        };

        let mut slots = Vec::new();
        for index in 1..=self.settings.total_browser_workers {
            slots.push(self.spawn_browser(index, &shutdown));
        }
        for index in 1..=self.settings.total_validation_workers {
            slots.push(self.spawn_validation(index, &shutdown));
        }

        let mut validation_disabled = false;
        let mut ticker = tokio::time::interval(SUPERVISE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.supervise(&mut slots, &shutdown, &mut validation_disabled).await;
                }
            }
        }

        info!("shutting down");
        shutdown.cancel();
        seeder.abort();
        sweep.abort();

        for slot in &mut slots {
            if let Some(handle) = slot.handle.take() {
                if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                    warn!(worker_id = %slot.worker_id, "worker did not stop in time");
                }
            }
        }

        // Whatever the workers could not hand back themselves.
        for slot in &slots {
            match self.db.recovery().release_worker(&slot.worker_id).await {
                Ok(cleanup) if cleanup.proxies_released > 0
                    || cleanup.catalog_tasks_returned > 0
                    || cleanup.object_tasks_returned > 0 =>
                {
                    info!(
                        worker_id = %slot.worker_id,
                        proxies = cleanup.proxies_released,
                        catalog_tasks = cleanup.catalog_tasks_returned,
                        object_tasks = cleanup.object_tasks_returned,
                        "reclaimed worker resources on shutdown"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(worker_id = %slot.worker_id, error = %e, "shutdown cleanup failed"),
            }
        }

        info!("shutdown complete");
        Ok(())
    }

    fn install_signal_handler(&self, shutdown: &CancellationToken) {
        let token = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(term) => term,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        token.cancel();
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            token.cancel();
        });
    }

    fn spawn_browser(&self, index: u32, shutdown: &CancellationToken) -> WorkerSlot {
        let worker_id = self.settings.browser_worker_id(index);
        let worker = BrowserWorker::new(
            worker_id.clone(),
            self.db.clone(),
            self.driver.clone(),
            self.settings.clone(),
            shutdown.child_token(),
        );
        info!(worker_id = %worker_id, "browser worker spawned");
        WorkerSlot {
            kind: WorkerKind::Browser,
            index,
            worker_id,
            handle: Some(tokio::spawn(worker.run())),
        }
    }

    fn spawn_validation(&self, index: u32, shutdown: &CancellationToken) -> WorkerSlot {
        let worker_id = self.settings.validation_worker_id(index);
        let worker = ValidationWorker::new(
            worker_id.clone(),
            self.db.clone(),
            self.validator.clone(),
            self.settings.clone(),
            shutdown.child_token(),
        );
        info!(worker_id = %worker_id, "validation worker spawned");
        WorkerSlot {
            kind: WorkerKind::Validation,
            index,
            worker_id,
            handle: Some(tokio::spawn(worker.run())),
        }
    }

    /// Restart any worker that stopped: reclaim its proxy and in-flight
    /// tasks first (the heartbeat-recovery path), then respawn. A
    /// validation worker that exited with the AI failure code stays
    /// down; once the last one is gone validation is disabled for the
    /// rest of the run.
    async fn supervise(
        &self,
        slots: &mut [WorkerSlot],
        shutdown: &CancellationToken,
        validation_disabled: &mut bool,
    ) {
        for slot in slots.iter_mut() {
            let finished = slot
                .handle
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(false);
            if !finished {
                continue;
            }

            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let exit_code = match handle.await {
                Ok(code) => code,
                Err(e) => {
                    error!(worker_id = %slot.worker_id, error = %e, "worker crashed");
                    1
                }
            };
            warn!(worker_id = %slot.worker_id, exit_code, "worker exited");

            match self.db.recovery().release_worker(&slot.worker_id).await {
                Ok(cleanup) => info!(
                    worker_id = %slot.worker_id,
                    proxies = cleanup.proxies_released,
                    catalog_tasks = cleanup.catalog_tasks_returned,
                    object_tasks = cleanup.object_tasks_returned,
                    "reclaimed dead worker resources"
                ),
                Err(e) => {
                    error!(worker_id = %slot.worker_id, error = %e, "failed to reclaim resources")
                }
            }

            if shutdown.is_cancelled() {
                continue;
            }

            if slot.kind == WorkerKind::Validation && exit_code == AI_FAILURE_EXIT_CODE {
                error!(
                    worker_id = %slot.worker_id,
                    "validation worker down after repeated AI failures, not restarting"
                );
                continue;
            }

            *slot = match slot.kind {
                WorkerKind::Browser => self.spawn_browser(slot.index, shutdown),
                WorkerKind::Validation => self.spawn_validation(slot.index, shutdown),
            };
        }

        if !*validation_disabled {
            let validation_alive = slots
                .iter()
                .any(|s| s.kind == WorkerKind::Validation && s.handle.is_some());
            let had_validation = self.settings.total_validation_workers > 0;
            if had_validation && !validation_alive {
                *validation_disabled = true;
                error!(
                    "all validation workers are down with AI failures; \
                     catalog parsing continues, restart to resume validation"
                );
            }
        }
    }
}
