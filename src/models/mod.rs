//! Domain types shared across repositories and workers.

mod articulum;
mod listing;
mod proxy;
mod task;
mod validation;

pub use articulum::{ArticulumState, ClaimedArticulum, StateError};
pub use listing::{CatalogListing, ObjectDataRecord};
pub use proxy::Proxy;
pub use task::{ClaimedCatalogTask, ClaimedObjectTask, TaskStatus};
pub use validation::{StageVerdict, ValidationStage};
