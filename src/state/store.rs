//! In-memory transfer collections backed by a `Persistence` implementation
//!
//! Every mutation runs under one async mutex and writes through to
//! persistence before touching memory, so a failed write leaves the
//! collections exactly as they were.

use super::persistence::Persistence;
use crate::error::{TrackerError, TrackerResult};
use crate::transfer::{CompletedTransfer, HandleKind, TransferRecord};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Change notification published after each committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted(String),
    Removed(String),
    Completed(String),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub ongoing: usize,
    pub completed: usize,
}

#[derive(Default)]
struct Collections {
    ongoing: HashMap<String, TransferRecord>,
    completed: HashMap<String, CompletedTransfer>,
}

pub struct TransferStore {
    collections: Mutex<Collections>,
    persistence: Arc<dyn Persistence>,
    changes: broadcast::Sender<StoreChange>,
}

impl TransferStore {
    /// Build a store from whatever the persistence layer holds
    pub async fn open(persistence: Arc<dyn Persistence>) -> TrackerResult<Self> {
        let snapshot = persistence.load().await?;
        let mut collections = Collections::default();

        for record in snapshot.completed {
            collections.completed.insert(record.id().to_string(), record);
        }
        for record in snapshot.ongoing {
            if collections.completed.contains_key(&record.id) {
                warn!(transfer_id = %record.id, "Transfer stored as both ongoing and completed, keeping completed");
                continue;
            }
            collections.ongoing.insert(record.id.clone(), record);
        }

        info!(
            "Transfer store opened with {} ongoing and {} completed transfers",
            collections.ongoing.len(),
            collections.completed.len()
        );

        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            collections: Mutex::new(collections),
            persistence,
            changes,
        })
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: StoreChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }

    /// Start tracking a newly submitted transfer. Rejects ids already known.
    pub async fn track(&self, record: TransferRecord) -> TrackerResult<()> {
        let mut collections = self.collections.lock().await;
        if collections.ongoing.contains_key(&record.id) {
            return Err(TrackerError::DuplicateTransfer { id: record.id });
        }
        if collections.completed.contains_key(&record.id) {
            return Err(TrackerError::AlreadyFinalized { id: record.id });
        }

        self.persistence.save_ongoing(&record).await?;
        let id = record.id.clone();
        collections.ongoing.insert(id.clone(), record);
        drop(collections);

        debug!(transfer_id = %id, "Tracking new transfer");
        self.publish(StoreChange::Upserted(id));
        Ok(())
    }

    /// Insert or merge an ongoing record by id
    pub async fn upsert_ongoing(&self, record: TransferRecord) -> TrackerResult<TransferRecord> {
        let mut collections = self.collections.lock().await;
        if collections.completed.contains_key(&record.id) {
            return Err(TrackerError::AlreadyFinalized { id: record.id });
        }

        let merged = match collections.ongoing.get(&record.id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge_from(record);
                merged
            }
            None => record,
        };

        self.persistence.save_ongoing(&merged).await?;
        collections.ongoing.insert(merged.id.clone(), merged.clone());
        drop(collections);

        self.publish(StoreChange::Upserted(merged.id.clone()));
        Ok(merged)
    }

    /// Mutate an ongoing record in place. `apply` returns whether anything changed;
    /// unchanged records are not written back.
    pub async fn modify_ongoing<F>(&self, id: &str, apply: F) -> TrackerResult<bool>
    where
        F: FnOnce(&mut TransferRecord) -> bool,
    {
        let mut collections = self.collections.lock().await;
        let Some(existing) = collections.ongoing.get(id) else {
            return Err(TrackerError::TransferNotFound { id: id.to_string() });
        };

        let mut updated = existing.clone();
        if !apply(&mut updated) {
            return Ok(false);
        }

        self.persistence.save_ongoing(&updated).await?;
        collections.ongoing.insert(id.to_string(), updated);
        drop(collections);

        self.publish(StoreChange::Upserted(id.to_string()));
        Ok(true)
    }

    /// Stop tracking an ongoing transfer without finalizing it
    pub async fn remove_ongoing(&self, id: &str) -> TrackerResult<Option<TransferRecord>> {
        let mut collections = self.collections.lock().await;
        if !collections.ongoing.contains_key(id) {
            return Ok(None);
        }

        self.persistence.delete_ongoing(id).await?;
        let removed = collections.ongoing.remove(id);
        drop(collections);

        self.publish(StoreChange::Removed(id.to_string()));
        Ok(removed)
    }

    /// Add a completed record for a transfer that is not ongoing
    pub async fn add_completed(&self, record: CompletedTransfer) -> TrackerResult<()> {
        let mut collections = self.collections.lock().await;
        let id = record.id().to_string();
        if collections.completed.contains_key(&id) {
            return Err(TrackerError::AlreadyFinalized { id });
        }
        if collections.ongoing.contains_key(&id) {
            return Err(TrackerError::Internal(format!(
                "transfer {id} is still ongoing, finalize it instead"
            )));
        }

        self.persistence.save_completed(&record).await?;
        collections.completed.insert(id.clone(), record);
        drop(collections);

        self.publish(StoreChange::Completed(id));
        Ok(())
    }

    /// Remove from `ongoing` and add to `completed` as one step
    pub async fn finalize(&self, record: CompletedTransfer) -> TrackerResult<()> {
        let mut collections = self.collections.lock().await;
        let id = record.id().to_string();
        if collections.completed.contains_key(&id) {
            return Err(TrackerError::AlreadyFinalized { id });
        }
        if !collections.ongoing.contains_key(&id) {
            return Err(TrackerError::TransferNotFound { id });
        }

        self.persistence.finalize(&record).await?;
        collections.ongoing.remove(&id);
        collections.completed.insert(id.clone(), record);
        drop(collections);

        self.publish(StoreChange::Completed(id));
        Ok(())
    }

    pub async fn list_ongoing(&self) -> Vec<TransferRecord> {
        let collections = self.collections.lock().await;
        let mut records: Vec<_> = collections.ongoing.values().cloned().collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        records
    }

    pub async fn get_ongoing(&self, id: &str) -> Option<TransferRecord> {
        self.collections.lock().await.ongoing.get(id).cloned()
    }

    pub async fn list_completed(&self) -> Vec<CompletedTransfer> {
        let collections = self.collections.lock().await;
        let mut records: Vec<_> = collections.completed.values().cloned().collect();
        records.sort_by(|a, b| b.finalized_at.cmp(&a.finalized_at));
        records
    }

    pub async fn get_completed(&self, id: &str) -> Option<CompletedTransfer> {
        self.collections.lock().await.completed.get(id).cloned()
    }

    pub async fn is_completed(&self, id: &str) -> bool {
        self.collections.lock().await.completed.contains_key(id)
    }

    /// Find the ongoing transfer carrying a given tracking handle
    pub async fn find_by_handle(&self, kind: HandleKind, value: &str) -> Option<TransferRecord> {
        let collections = self.collections.lock().await;
        collections
            .ongoing
            .values()
            .find(|r| {
                r.tracking_handles
                    .get(kind)
                    .is_some_and(|v| v.eq_ignore_ascii_case(value))
            })
            .cloned()
    }

    pub async fn find_completed_by_handle(
        &self,
        kind: HandleKind,
        value: &str,
    ) -> Option<CompletedTransfer> {
        let collections = self.collections.lock().await;
        collections
            .completed
            .values()
            .find(|r| {
                r.transfer
                    .tracking_handles
                    .get(kind)
                    .is_some_and(|v| v.eq_ignore_ascii_case(value))
            })
            .cloned()
    }

    pub async fn stats(&self) -> StoreStats {
        let collections = self.collections.lock().await;
        StoreStats {
            ongoing: collections.ongoing.len(),
            completed: collections.completed.len(),
        }
    }

    pub async fn health_check(&self) -> TrackerResult<()> {
        self.persistence.health_check().await
    }
}
