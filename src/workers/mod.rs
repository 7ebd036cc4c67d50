//! Worker loops.
//!
//! Browser workers drain the two task queues with a Chromium behind a
//! claimed proxy; validation workers run the filter pipeline with no
//! browser at all. Both are plain async loops supervised by the
//! orchestrator; all coordination goes through the database.

mod browser;
mod validation;

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::repository::DbContext;

pub use browser::BrowserWorker;
pub use validation::{ValidationWorker, AI_FAILURE_EXIT_CODE};

/// Which queue a heartbeat belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TaskKind {
    Catalog,
    Object,
}

/// Background task refreshing `heartbeat_at` while a task is in flight.
/// Aborted by the worker once the task settles; a missed abort only
/// means harmless extra updates until the row leaves `processing`.
pub(crate) fn spawn_heartbeat(
    db: DbContext,
    kind: TaskKind,
    task_id: i64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = match kind {
                TaskKind::Catalog => db.catalog_tasks().heartbeat(task_id).await,
                TaskKind::Object => db.object_tasks().heartbeat(task_id).await,
            };
            if let Err(e) = result {
                warn!(task_id, error = %e, "heartbeat update failed");
            }
        }
    })
}
