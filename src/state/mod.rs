//! Transfer record storage
//!
//! Handles:
//! - The `ongoing` and `completed` transfer collections
//! - Durable persistence behind the `Persistence` trait (memory or PostgreSQL)
//! - Change notifications for observers

mod persistence;
mod postgres;
mod store;

pub use persistence::{MemoryPersistence, Persistence, Snapshot};
pub use postgres::PgPersistence;
pub use store::{StoreChange, StoreStats, TransferStore};

#[cfg(test)]
pub use persistence::MockPersistence;
