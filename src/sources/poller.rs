//! Interval runner shared by the polling sources

use crate::error::TrackerResult;
use crate::events::{SignalSource, StatusEvent};
use crate::state::TransferStore;
use crate::transfer::TransferRecord;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A source that is asked about a batch of transfers on a fixed cadence
#[async_trait]
pub trait PollingSource: Send + Sync {
    fn kind(&self) -> SignalSource;

    /// Whether this source can report on the transfer at all
    fn matches(&self, record: &TransferRecord) -> bool;

    async fn poll(&self, records: &[TransferRecord]) -> TrackerResult<Vec<StatusEvent>>;
}

/// Drives a `PollingSource` with single-flight cycles.
///
/// A tick that arrives while the previous cycle is still in flight is skipped.
pub struct Poller<S> {
    source: S,
    store: Arc<TransferStore>,
    events: mpsc::Sender<StatusEvent>,
    period: Duration,
    in_flight: Arc<Mutex<()>>,
}

impl<S: PollingSource + 'static> Poller<S> {
    pub fn new(
        source: S,
        store: Arc<TransferStore>,
        events: mpsc::Sender<StatusEvent>,
        period: Duration,
    ) -> Self {
        Self {
            source,
            store,
            events,
            period,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let kind = self.source.kind();
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<()>> = None;

        info!(source = %kind, period_secs = self.period.as_secs(), "Poller started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Some(handle) = self.try_start_cycle() {
                        current = Some(handle);
                    }
                }
            }
        }

        // Do not wait for a request that is still out
        if let Some(handle) = current {
            handle.abort();
        }
        info!(source = %kind, "Poller stopped");
    }

    /// Spawn one poll cycle unless another is in flight
    pub fn try_start_cycle(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let permit = match self.in_flight.clone().try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(source = %self.source.kind(), "Previous poll still running, skipping tick");
                return None;
            }
        };

        let this = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = this.poll_once().await {
                warn!(source = %this.source.kind(), "Poll cycle failed: {}", e);
                crate::metrics::record_source_error(this.source.kind(), &e);
            }
        }))
    }

    /// Poll every eligible ongoing transfer once and forward the events.
    /// Returns the number of events forwarded.
    pub async fn poll_once(&self) -> TrackerResult<usize> {
        let eligible: Vec<TransferRecord> = self
            .store
            .list_ongoing()
            .await
            .into_iter()
            .filter(|r| r.lifecycle.is_pending() && self.source.matches(r))
            .collect();

        if eligible.is_empty() {
            return Ok(0);
        }

        debug!(source = %self.source.kind(), "Polling {} transfers", eligible.len());
        let events = self.source.poll(&eligible).await?;
        let count = events.len();

        for event in events {
            self.events
                .send(event)
                .await
                .map_err(|_| crate::error::TrackerError::ChannelClosed("status events"))?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTarget;
    use crate::state::MemoryPersistence;
    use crate::transfer::fixtures::*;
    use crate::transfer::Direction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct GatedSource {
        gate: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PollingSource for GatedSource {
        fn kind(&self) -> SignalSource {
            SignalSource::History
        }

        fn matches(&self, record: &TransferRecord) -> bool {
            record.direction == Direction::ToPolkadot
        }

        async fn poll(&self, records: &[TransferRecord]) -> TrackerResult<Vec<StatusEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(records
                .iter()
                .map(|r| {
                    StatusEvent::progress(SignalSource::History, EventTarget::Id(r.id.clone()), "Pending")
                })
                .collect())
        }
    }

    async fn store_with_transfers() -> Arc<TransferStore> {
        let store = Arc::new(
            TransferStore::open(Arc::new(MemoryPersistence::new()))
                .await
                .unwrap(),
        );
        store.track(record("0x1", ethereum(), asset_hub())).await.unwrap();
        store.track(record("0x2", hydration(), asset_hub())).await.unwrap();
        store
    }

    #[tokio::test]
    async fn overlapping_cycles_are_skipped() {
        let store = store_with_transfers().await;
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(8);
        let poller = Arc::new(Poller::new(
            GatedSource {
                gate: gate.clone(),
                calls: calls.clone(),
            },
            store,
            tx,
            Duration::from_secs(30),
        ));

        let first = poller.try_start_cycle().expect("first cycle starts");
        tokio::task::yield_now().await;
        assert!(poller.try_start_cycle().is_none());

        gate.notify_one();
        first.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Only the ToPolkadot transfer is eligible
        let event = rx.recv().await.unwrap();
        assert_eq!(event.target, EventTarget::Id("0x1".into()));
        assert!(rx.try_recv().is_err());

        assert!(poller.try_start_cycle().is_some());
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_for_in_flight_poll() {
        let store = store_with_transfers().await;
        let (tx, _rx) = mpsc::channel(8);
        let poller = Arc::new(Poller::new(
            GatedSource {
                gate: Arc::new(Notify::new()),
                calls: Arc::new(AtomicUsize::new(0)),
            },
            store,
            tx,
            Duration::from_millis(5),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller stops promptly")
            .unwrap();
    }
}
