//! Single-writer reconciliation loop

use super::policy::ConflictPolicy;
use crate::clock::Clock;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventTarget, Signal, SignalSource, StatusEvent};
use crate::notify::{Notification, Notifier, TransferMetric};
use crate::state::TransferStore;
use crate::transfer::{CompletedTransfer, HandleKind, Outcome, TransferRecord};

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// What applying one event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Progress label or handles changed
    Progressed,
    /// Nothing new in a progress event
    Unchanged,
    Finalized(Outcome),
    /// Terminal event for a transfer that is already completed
    Discarded { existing: Outcome },
    /// No transfer matched the event
    Unmatched,
    /// Store rejected the change, the transfer stays pending
    Failed,
}

enum Resolved {
    Ongoing(TransferRecord),
    Completed(Outcome),
    Missing,
}

pub struct Reconciler {
    store: Arc<TransferStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: ConflictPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<TransferStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            policy,
        }
    }

    /// Main reconciliation loop.
    ///
    /// Each wakeup drains everything queued so far into one tick.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<StatusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TrackerResult<()> {
        info!(policy = ?self.policy, "Reconciler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}

                received = events.recv() => {
                    let Some(first) = received else {
                        warn!("All status producers dropped, reconciler exiting");
                        break;
                    };

                    let mut batch = vec![first];
                    while let Ok(event) = events.try_recv() {
                        batch.push(event);
                    }
                    self.reconcile_tick(batch).await;
                }
            }
        }

        info!("Reconciler stopped");
        Ok(())
    }

    /// Apply one tick worth of events in policy order
    pub async fn reconcile_tick(&self, batch: Vec<StatusEvent>) -> Vec<ApplyOutcome> {
        debug!("Reconciling {} status events", batch.len());

        let mut outcomes = Vec::with_capacity(batch.len());
        for event in self.policy.order(batch) {
            outcomes.push(self.apply(event).await);
        }

        crate::metrics::set_ongoing_transfers(self.store.stats().await.ongoing);
        outcomes
    }

    pub async fn apply(&self, event: StatusEvent) -> ApplyOutcome {
        crate::metrics::record_event(event.source, event.is_terminal());

        match self.resolve(&event.target).await {
            Resolved::Missing => {
                debug!(source = %event.source, event_target = %event.target, "No transfer matches status event");
                ApplyOutcome::Unmatched
            }
            Resolved::Completed(existing) => match event.outcome() {
                Some(outcome) => {
                    self.record_conflict(event.source, existing, outcome, &event.target);
                    ApplyOutcome::Discarded { existing }
                }
                None => ApplyOutcome::Unchanged,
            },
            Resolved::Ongoing(record) => match event.signal {
                Signal::Progress { label } => {
                    self.apply_progress(&record.id, label, event.discovered)
                        .await
                }
                Signal::Terminal {
                    outcome,
                    label,
                    error_detail,
                } => {
                    let source = event.source;
                    let discovered = event.discovered;
                    self.finalize(record, source, outcome, label, error_detail, discovered)
                        .await
                }
            },
        }
    }

    async fn resolve(&self, target: &EventTarget) -> Resolved {
        match target {
            EventTarget::Id(id) => {
                if let Some(record) = self.store.get_ongoing(id).await {
                    return Resolved::Ongoing(record);
                }
                match self.store.get_completed(id).await {
                    Some(completed) => Resolved::Completed(completed.outcome),
                    None => Resolved::Missing,
                }
            }
            EventTarget::Handle { kind, value } => {
                if let Some(record) = self.store.find_by_handle(*kind, value).await {
                    return Resolved::Ongoing(record);
                }
                match self.store.find_completed_by_handle(*kind, value).await {
                    Some(completed) => Resolved::Completed(completed.outcome),
                    None => Resolved::Missing,
                }
            }
        }
    }

    async fn apply_progress(
        &self,
        id: &str,
        label: String,
        discovered: Option<(HandleKind, String)>,
    ) -> ApplyOutcome {
        let result = self
            .store
            .modify_ongoing(id, |record| {
                let mut changed = false;
                if !label.is_empty() && record.status != label {
                    record.status = label;
                    changed = true;
                }
                if let Some((kind, value)) = discovered {
                    changed |= record.tracking_handles.insert(kind, value);
                }
                changed
            })
            .await;

        match result {
            Ok(true) => ApplyOutcome::Progressed,
            Ok(false) => ApplyOutcome::Unchanged,
            // Finalized between resolve and modify
            Err(TrackerError::TransferNotFound { .. }) => ApplyOutcome::Unchanged,
            Err(e) => {
                warn!(transfer_id = %id, "Failed to update transfer progress: {}", e);
                self.notifier.capture_error("progress update", &e);
                ApplyOutcome::Failed
            }
        }
    }

    async fn finalize(
        &self,
        mut record: TransferRecord,
        source: SignalSource,
        outcome: Outcome,
        label: String,
        error_detail: Option<String>,
        discovered: Option<(HandleKind, String)>,
    ) -> ApplyOutcome {
        if !label.is_empty() {
            record.status = label;
        }
        if let Some((kind, value)) = discovered {
            record.tracking_handles.insert(kind, value);
        }

        let id = record.id.clone();
        let completed = CompletedTransfer::finalize(record, outcome, self.clock.now(), error_detail);

        match self.store.finalize(completed.clone()).await {
            Ok(()) => {
                info!(
                    transfer_id = %id,
                    source = %source,
                    outcome = %outcome,
                    "Transfer finalized"
                );
                self.notifier.notify(Notification::for_completed(&completed));
                self.notifier
                    .record_metric(TransferMetric::for_completed(&completed));
                if source == SignalSource::Sweeper {
                    crate::metrics::record_stale_transfer(completed.transfer.direction);
                }
                ApplyOutcome::Finalized(outcome)
            }
            Err(TrackerError::AlreadyFinalized { .. }) => {
                let existing = self
                    .store
                    .get_completed(&id)
                    .await
                    .map(|c| c.outcome)
                    .unwrap_or(outcome);
                let event_target = EventTarget::Id(id);
                self.record_conflict(source, existing, outcome, &event_target);
                ApplyOutcome::Discarded { existing }
            }
            Err(e) => {
                error!(transfer_id = %id, "Failed to finalize transfer, keeping it pending: {}", e);
                self.notifier.capture_error("finalize transfer", &e);
                ApplyOutcome::Failed
            }
        }
    }

    fn record_conflict(
        &self,
        source: SignalSource,
        existing: Outcome,
        discarded: Outcome,
        target: &EventTarget,
    ) {
        if existing != discarded {
            info!(
                event_target = %target,
                source = %source,
                kept = %existing,
                discarded = %discarded,
                "Discarding conflicting terminal signal for finalized transfer"
            );
        } else {
            debug!(event_target = %target, source = %source, "Discarding duplicate terminal signal");
        }
        crate::metrics::record_conflicting_signal(source);
    }
}
