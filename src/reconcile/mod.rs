//! Reconciliation of status events into transfer state
//!
//! The reconciler:
//! 1. Is the single consumer of every status source and the staleness sweeper
//! 2. Updates progress labels and tracking handles on ongoing transfers
//! 3. Moves a transfer to `completed` exactly once on its first terminal signal
//! 4. Notifies the user and records metrics for each finalized transfer

pub mod engine;
pub mod policy;

pub use engine::{ApplyOutcome, Reconciler};
pub use policy::ConflictPolicy;
