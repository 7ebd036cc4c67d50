//! Database access layer.
//!
//! The database is the single source of truth for queues, articulum
//! state, listings, validation outcomes, proxy occupancy and heartbeats;
//! all coordination goes through atomic SQL. Claims use
//! `FOR UPDATE SKIP LOCKED`, lifecycle transitions use conditional
//! `UPDATE ... WHERE state = <expected>` — there are no application-level
//! locks on top.

mod articulums;
mod catalog_tasks;
mod context;
mod listings;
mod object_tasks;
mod pool;
mod proxies;
mod recovery;
mod util;
mod validation;

pub use articulums::ArticulumRepository;
pub use catalog_tasks::CatalogTaskRepository;
pub use context::DbContext;
pub use listings::ListingRepository;
pub use object_tasks::ObjectTaskRepository;
pub use pool::{DbError, PgPool};
pub use proxies::{ProxyEntry, ProxyPoolError, ProxyRepository, ProxyStats};
pub use recovery::{RecoveryRepository, SweepReport, WorkerCleanup};
pub use validation::ValidationRepository;
