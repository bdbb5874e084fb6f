//! Offline-first sync pipeline: durable queue, drain executor, scheduler.

mod executor;
mod model;
mod queue;
mod reconcile;
mod remote;
mod scheduler;

pub use executor::*;
pub use model::*;
pub use queue::*;
pub use reconcile::*;
pub use remote::*;
pub use scheduler::*;
