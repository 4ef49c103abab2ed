//! Staleness sweeper
//!
//! Periodically force-finalizes pending transfers older than the threshold
//! for their direction. The sweeper never touches the store itself: it emits
//! a terminal `Unknown` event and the reconciler's idempotence guard decides
//! whether it still applies.

use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventTarget, SignalSource, StatusEvent};
use crate::state::TransferStore;
use crate::transfer::{Outcome, TransferRecord};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

pub struct StalenessSweeper {
    store: Arc<TransferStore>,
    events: mpsc::Sender<StatusEvent>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl StalenessSweeper {
    pub fn new(
        store: Arc<TransferStore>,
        events: mpsc::Sender<StatusEvent>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    /// Terminal events for every pending record past its threshold at `now`
    pub fn stale_events(&self, records: &[TransferRecord], now: DateTime<Utc>) -> Vec<StatusEvent> {
        records
            .iter()
            .filter(|r| r.lifecycle.is_pending())
            .filter_map(|record| {
                let threshold = self.config.threshold(record.direction);
                // A submission time in the future counts as age zero
                let age = (now - record.submitted_at).to_std().unwrap_or(Duration::ZERO);
                if age <= threshold {
                    return None;
                }

                warn!(
                    transfer_id = %record.id,
                    direction = record.direction.as_str(),
                    age_secs = age.as_secs(),
                    threshold_secs = threshold.as_secs(),
                    "Transfer is stale, finalizing with unknown outcome"
                );

                Some(
                    StatusEvent::terminal(
                        SignalSource::Sweeper,
                        EventTarget::Id(record.id.clone()),
                        Outcome::Unknown,
                        "Timed out",
                    )
                    .with_error(format!(
                        "No final status after {} minutes",
                        age.as_secs() / 60
                    )),
                )
            })
            .collect()
    }

    /// Scan the ongoing collection once. Returns the number of events emitted.
    pub async fn sweep(&self) -> TrackerResult<usize> {
        let ongoing = self.store.list_ongoing().await;
        let events = self.stale_events(&ongoing, self.clock.now());
        let count = events.len();

        for event in events {
            self.events
                .send(event)
                .await
                .map_err(|_| TrackerError::ChannelClosed("status events"))?;
        }

        Ok(count)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.config.interval_secs, "Staleness sweeper started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(count) => info!("Sweeper flagged {} stale transfers", count),
                        Err(e) => {
                            warn!("Sweep failed: {}", e);
                            if matches!(e, TrackerError::ChannelClosed(_)) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Staleness sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::recording::RecordingNotifier;
    use crate::notify::Severity;
    use crate::reconcile::{ApplyOutcome, ConflictPolicy, Reconciler};
    use crate::state::MemoryPersistence;
    use crate::transfer::fixtures::*;

    struct Harness {
        store: Arc<TransferStore>,
        clock: Arc<ManualClock>,
        sweeper: StalenessSweeper,
        events: mpsc::Receiver<StatusEvent>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(
            TransferStore::open(Arc::new(MemoryPersistence::new()))
                .await
                .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(submitted_at()));
        let (tx, rx) = mpsc::channel(16);
        let sweeper = StalenessSweeper::new(
            store.clone(),
            tx,
            clock.clone(),
            SweeperConfig::default(),
        );
        Harness {
            store,
            clock,
            sweeper,
            events: rx,
        }
    }

    #[tokio::test]
    async fn intra_network_threshold_is_exclusive() {
        let mut h = harness().await;
        h.store
            .track(record("0x1", hydration(), asset_hub()))
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(30));
        assert_eq!(h.sweeper.sweep().await.unwrap(), 0);

        h.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(h.sweeper.sweep().await.unwrap(), 1);

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.source, SignalSource::Sweeper);
        assert_eq!(event.outcome(), Some(Outcome::Unknown));
    }

    #[tokio::test]
    async fn bridge_transfers_get_the_long_threshold() {
        let h = harness().await;
        let bridge = record("0xb", asset_hub(), ethereum());
        let hop = record("0xh", hydration(), asset_hub());

        let now = submitted_at() + chrono::Duration::hours(2);
        let stale = h.sweeper.stale_events(&[bridge, hop], now);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].target, EventTarget::Id("0xh".into()));
    }

    #[tokio::test]
    async fn future_submission_is_not_stale() {
        let h = harness().await;
        let mut early = record("0x1", hydration(), asset_hub());
        early.submitted_at = submitted_at() + chrono::Duration::hours(1);
        assert!(h.sweeper.stale_events(&[early], submitted_at()).is_empty());
    }

    #[tokio::test]
    async fn stale_bridge_transfer_finalizes_unknown() {
        let mut h = harness().await;
        h.store
            .track(record("0xdead", asset_hub(), ethereum()))
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = Reconciler::new(
            h.store.clone(),
            notifier.clone(),
            h.clock.clone(),
            ConflictPolicy::FirstWins,
        );

        h.clock.advance(chrono::Duration::hours(7));
        assert_eq!(h.sweeper.sweep().await.unwrap(), 1);

        let event = h.events.recv().await.unwrap();
        assert_eq!(
            reconciler.reconcile_tick(vec![event]).await,
            vec![ApplyOutcome::Finalized(Outcome::Unknown)]
        );

        let completed = h.store.get_completed("0xdead").await.unwrap();
        assert_eq!(completed.outcome, Outcome::Unknown);
        assert!(h.store.get_ongoing("0xdead").await.is_none());
        assert_eq!(notifier.notifications()[0].severity, Severity::Warning);

        // Nothing left to sweep
        assert_eq!(h.sweeper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_sweeps_count_one_stale_transfer() {
        let mut h = harness().await;
        h.store
            .track(record("0xeth", ethereum(), ethereum()))
            .await
            .unwrap();
        let reconciler = Reconciler::new(
            h.store.clone(),
            Arc::new(RecordingNotifier::default()),
            h.clock.clone(),
            ConflictPolicy::FirstWins,
        );
        let stale = || {
            crate::metrics::STALE_TRANSFERS
                .with_label_values(&["within_ethereum"])
                .get()
        };
        let before = stale();

        // The reconciler has not caught up between the two sweeps
        h.clock.advance(chrono::Duration::hours(1));
        assert_eq!(h.sweeper.sweep().await.unwrap(), 1);
        assert_eq!(h.sweeper.sweep().await.unwrap(), 1);
        assert_eq!(stale(), before);

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        assert_eq!(
            reconciler.reconcile_tick(vec![first, second]).await,
            vec![
                ApplyOutcome::Finalized(Outcome::Unknown),
                ApplyOutcome::Discarded {
                    existing: Outcome::Unknown
                }
            ]
        );
        assert_eq!(stale() - before, 1.0);
    }

    #[tokio::test]
    async fn sweep_reports_closed_channel() {
        let h = harness().await;
        h.store
            .track(record("0x1", hydration(), asset_hub()))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::hours(1));
        drop(h.events);

        let err = h.sweeper.sweep().await.unwrap_err();
        assert!(matches!(err, TrackerError::ChannelClosed(_)));
    }
}
