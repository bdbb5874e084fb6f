//! Offline-first synchronization core for a mobile commerce client.
//!
//! Local documents are the source of truth for the UI; every remote-visible
//! change is applied optimistically and queued as a durable intent, then
//! drained in order once connectivity allows. [`context::CommerceContext`]
//! wires the pieces together for hosts.

pub mod commerce;
pub mod connectivity;
pub mod context;
pub mod errors;
pub mod store;
pub mod sync;

pub use context::{CommerceContext, MutationRequest, SyncConfig};
pub use errors::{Error, Result};
