//! Persistence boundary for the transfer store

use crate::error::{TrackerError, TrackerResult};
use crate::transfer::{CompletedTransfer, TransferRecord};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Everything persisted, as loaded at startup
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub ongoing: Vec<TransferRecord>,
    pub completed: Vec<CompletedTransfer>,
}

/// Durable key-value storage for both transfer collections.
///
/// `finalize` must move a record from ongoing to completed in one step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self) -> TrackerResult<Snapshot>;

    async fn save_ongoing(&self, record: &TransferRecord) -> TrackerResult<()>;

    async fn delete_ongoing(&self, id: &str) -> TrackerResult<()>;

    async fn save_completed(&self, record: &CompletedTransfer) -> TrackerResult<()>;

    async fn finalize(&self, record: &CompletedTransfer) -> TrackerResult<()>;

    async fn health_check(&self) -> TrackerResult<()>;
}

#[derive(Debug, Clone)]
enum Entry {
    Ongoing(TransferRecord),
    Completed(CompletedTransfer),
}

/// Process-local persistence, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self) -> TrackerResult<Snapshot> {
        let entries = self.entries.lock().await;
        let mut snapshot = Snapshot::default();
        for entry in entries.values() {
            match entry {
                Entry::Ongoing(record) => snapshot.ongoing.push(record.clone()),
                Entry::Completed(record) => snapshot.completed.push(record.clone()),
            }
        }
        Ok(snapshot)
    }

    async fn save_ongoing(&self, record: &TransferRecord) -> TrackerResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(Entry::Completed(_)) = entries.get(&record.id) {
            return Err(TrackerError::AlreadyFinalized {
                id: record.id.clone(),
            });
        }
        entries.insert(record.id.clone(), Entry::Ongoing(record.clone()));
        Ok(())
    }

    async fn delete_ongoing(&self, id: &str) -> TrackerResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(Entry::Ongoing(_)) = entries.get(id) {
            entries.remove(id);
        }
        Ok(())
    }

    async fn save_completed(&self, record: &CompletedTransfer) -> TrackerResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(record.id()) {
            return Err(TrackerError::Persistence(format!(
                "transfer {} already stored",
                record.id()
            )));
        }
        entries.insert(record.id().to_string(), Entry::Completed(record.clone()));
        Ok(())
    }

    async fn finalize(&self, record: &CompletedTransfer) -> TrackerResult<()> {
        let mut entries = self.entries.lock().await;
        match entries.get(record.id()) {
            Some(Entry::Completed(_)) => Err(TrackerError::AlreadyFinalized {
                id: record.id().to_string(),
            }),
            _ => {
                entries.insert(record.id().to_string(), Entry::Completed(record.clone()));
                Ok(())
            }
        }
    }

    async fn health_check(&self) -> TrackerResult<()> {
        Ok(())
    }
}
