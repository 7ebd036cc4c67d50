//! Background producers: task seeding and the heartbeat recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::repository::DbContext;

const SEED_INTERVAL: Duration = Duration::from_secs(15);

/// Poll for `NEW` articulums lacking a live catalog task and enqueue
/// them, batched. The articulum transition happens at claim time, not
/// here.
pub(super) async fn seed_catalog_loop(db: DbContext, shutdown: CancellationToken) {
    loop {
        match db.catalog_tasks().seed_from_new().await {
            Ok(0) => {}
            Ok(created) => info!(created, "seeded catalog tasks"),
            Err(e) => error!(error = %e, "catalog seeding failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(SEED_INTERVAL) => {}
        }
    }
}

/// Periodic recovery sweep over both task tables plus orphan repair.
/// This is the only crash-recovery mechanism in the system.
pub(super) async fn recovery_loop(
    db: DbContext,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
) {
    info!(
        period_secs = settings.heartbeat_check_interval.as_secs(),
        timeout_secs = settings.heartbeat_timeout.as_secs(),
        "heartbeat recovery running"
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(settings.heartbeat_check_interval) => {}
        }
        match db.recovery().sweep(settings.heartbeat_timeout).await {
            Ok(report) if report.total() > 0 => info!(
                catalog = report.catalog_returned,
                object = report.object_returned,
                orphans = report.orphans_fixed,
                "recovery sweep returned work"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "recovery sweep failed"),
        }
    }
}
