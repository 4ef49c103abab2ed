//! Push subscriptions for XCM hops inside the Polkadot network
//!
//! One subscription is opened per eligible ongoing transfer. Notifications
//! are correlated to the transfer by the origin extrinsic hash (or the EVM
//! transaction hash on EVM parachains) and turned into status events. A
//! terminal notification closes the subscription, and so does the transfer
//! leaving the ongoing collection for any reason. Failed opens are retried
//! with exponential backoff and abandoned after rejected credentials or
//! repeated failures.

use crate::clock::Clock;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventTarget, SignalSource, StatusEvent};
use crate::state::{StoreChange, TransferStore};
use crate::transfer::{Direction, HandleKind, Outcome, TransferRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accounts whose messages the subscription reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderFilter {
    Any,
    Accounts(Vec<String>),
}

impl Serialize for SenderFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SenderFilter::Any => serializer.serialize_str("*"),
            SenderFilter::Accounts(accounts) => accounts.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    pub subscription_id: Uuid,
    pub origin_routing_id: u32,
    pub destination_routing_id: u32,
    pub sender_filter: SenderFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum XcmEventKind {
    #[serde(rename = "xcm.sent")]
    Sent,
    #[serde(rename = "xcm.relayed")]
    Relayed,
    #[serde(rename = "xcm.hop")]
    Hop,
    #[serde(rename = "xcm.received")]
    Received,
    #[serde(rename = "xcm.timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum XcmOutcome {
    Success,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginEvent {
    #[serde(default)]
    pub evm_tx_hash: Option<String>,
}

/// Notification as it arrives from the subscription service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNotification {
    pub event_kind: XcmEventKind,
    #[serde(default)]
    pub origin_event: OriginEvent,
    #[serde(default)]
    pub origin_extrinsic_hash: Option<String>,
    #[serde(default)]
    pub waypoint_outcome: Option<XcmOutcome>,
    #[serde(default)]
    pub destination_outcome: Option<XcmOutcome>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Where a notification came from on the origin chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRef {
    pub extrinsic_hash: Option<String>,
    pub evm_tx_hash: Option<String>,
    pub message_id: Option<String>,
}

/// Decoded notification, one variant per event kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcmEvent {
    Sent {
        origin: OriginRef,
    },
    Relayed {
        origin: OriginRef,
    },
    Hop {
        origin: OriginRef,
        outcome: XcmOutcome,
        error: Option<String>,
    },
    Received {
        origin: OriginRef,
        outcome: XcmOutcome,
        error: Option<String>,
    },
    Timeout {
        origin: OriginRef,
    },
}

impl TryFrom<WireNotification> for XcmEvent {
    type Error = TrackerError;

    fn try_from(wire: WireNotification) -> Result<Self, Self::Error> {
        let origin = OriginRef {
            extrinsic_hash: wire.origin_extrinsic_hash,
            evm_tx_hash: wire.origin_event.evm_tx_hash,
            message_id: wire.message_id,
        };
        let missing = |field: &str| TrackerError::Decode {
            what: "subscription notification",
            message: format!("{field} missing"),
        };

        Ok(match wire.event_kind {
            XcmEventKind::Sent => XcmEvent::Sent { origin },
            XcmEventKind::Relayed => XcmEvent::Relayed { origin },
            XcmEventKind::Hop => XcmEvent::Hop {
                origin,
                outcome: wire.waypoint_outcome.ok_or_else(|| missing("waypointOutcome"))?,
                error: wire.error,
            },
            XcmEventKind::Received => XcmEvent::Received {
                origin,
                outcome: wire
                    .destination_outcome
                    .ok_or_else(|| missing("destinationOutcome"))?,
                error: wire.error,
            },
            XcmEventKind::Timeout => XcmEvent::Timeout { origin },
        })
    }
}

impl XcmEvent {
    pub fn origin(&self) -> &OriginRef {
        match self {
            XcmEvent::Sent { origin }
            | XcmEvent::Relayed { origin }
            | XcmEvent::Hop { origin, .. }
            | XcmEvent::Received { origin, .. }
            | XcmEvent::Timeout { origin } => origin,
        }
    }

    /// Whether this notification is about `record`.
    ///
    /// EVM parachains emit the EVM transaction hash, which is what the
    /// transfer id holds for them; everywhere else the extrinsic hash is used.
    pub fn correlates(&self, record: &TransferRecord) -> bool {
        let origin = self.origin();
        let hash = match (&origin.evm_tx_hash, record.source_chain.supports_evm_tx_hash) {
            (Some(evm_hash), true) => Some(evm_hash),
            _ => origin.extrinsic_hash.as_ref(),
        };
        hash.is_some_and(|h| super::same_hash(h, &record.id))
    }

    pub fn into_status(self, record: &TransferRecord) -> StatusEvent {
        let target = EventTarget::Id(record.id.clone());
        let source = SignalSource::Subscription;
        let message_id = self.origin().message_id.clone();

        let event = match self {
            XcmEvent::Sent { .. } => StatusEvent::progress(source, target, "Sent"),
            XcmEvent::Relayed { .. } => StatusEvent::progress(source, target, "Relayed"),
            XcmEvent::Hop {
                outcome: XcmOutcome::Success,
                ..
            } => StatusEvent::progress(source, target, "Forwarded"),
            XcmEvent::Hop {
                outcome: XcmOutcome::Fail,
                error,
                ..
            } => StatusEvent::terminal(source, target, Outcome::Failed, "Hop failed")
                .with_error(error.unwrap_or_else(|| "Intermediate hop failed".to_string())),
            XcmEvent::Received {
                outcome: XcmOutcome::Success,
                ..
            } => StatusEvent::terminal(source, target, Outcome::Succeeded, "Received"),
            XcmEvent::Received {
                outcome: XcmOutcome::Fail,
                error,
                ..
            } => StatusEvent::terminal(source, target, Outcome::Failed, "Failed")
                .with_error(error.unwrap_or_else(|| "Execution failed on destination".to_string())),
            XcmEvent::Timeout { .. } => {
                StatusEvent::terminal(source, target, Outcome::Unknown, "Timed out")
            }
        };

        match message_id {
            Some(id) => event.with_handle(HandleKind::SubscriptionId, id),
            None => event,
        }
    }
}

pub type NotificationStream = mpsc::Receiver<TrackerResult<WireNotification>>;

/// Connection to the subscription service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    async fn open(&self, params: SubscriptionParams) -> TrackerResult<NotificationStream>;
}

/// Only XCM hops get a subscription, and never a swap that stays on one chain
pub fn is_subscribable(record: &TransferRecord) -> bool {
    record.direction == Direction::WithinPolkadot
        && !record.is_same_chain_swap()
        && record.source_chain.routing_id.is_some()
        && record.destination_chain.routing_id.is_some()
}

/// Failed opens before a transfer is left to history polling and the sweeper
const MAX_OPEN_ATTEMPTS: u32 = 5;
const OPEN_RETRY_BASE_SECS: i64 = 15;
const OPEN_RETRY_MAX_SECS: i64 = 600;

/// How a follower task ended
#[derive(Debug)]
enum FollowEnd {
    /// Terminal notification forwarded, or nobody left to forward to
    Done,
    /// The connection went away after it was open
    Dropped,
    OpenFailed(TrackerError),
}

struct ActiveSubscription {
    subscription_id: Uuid,
    task: JoinHandle<FollowEnd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenFailures {
    attempts: u32,
    /// `None` once reopening has been given up
    retry_at: Option<DateTime<Utc>>,
}

fn retry_delay(attempts: u32) -> chrono::Duration {
    let doublings = attempts.saturating_sub(1).min(10);
    chrono::Duration::seconds((OPEN_RETRY_BASE_SECS << doublings).min(OPEN_RETRY_MAX_SECS))
}

pub struct SubscriptionSource<T> {
    transport: Arc<T>,
    store: Arc<TransferStore>,
    events: mpsc::Sender<StatusEvent>,
    clock: Arc<dyn Clock>,
    active: DashMap<String, ActiveSubscription>,
    failures: DashMap<String, OpenFailures>,
    resync_period: Duration,
}

impl<T: SubscriptionTransport + 'static> SubscriptionSource<T> {
    pub fn new(
        transport: T,
        store: Arc<TransferStore>,
        events: mpsc::Sender<StatusEvent>,
        clock: Arc<dyn Clock>,
        resync_period: Duration,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            store,
            events,
            clock,
            active: DashMap::new(),
            failures: DashMap::new(),
            resync_period,
        }
    }

    pub fn matches(&self, record: &TransferRecord) -> bool {
        is_subscribable(record)
    }

    /// Subscriptions whose follower is still running
    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.active
            .get(id)
            .is_some_and(|s| !s.task.is_finished())
    }

    fn publish_active(&self) {
        crate::metrics::set_active_subscriptions(self.active_count());
    }

    /// Whether a previous open failure still holds back a new attempt
    fn backing_off(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.failures
            .get(id)
            .is_some_and(|f| f.retry_at.map_or(true, |at| now < at))
    }

    /// Collect the result of a finished follower and remember failures
    fn reap(&self, id: &str) {
        let Some((_, finished)) = self.active.remove_if(id, |_, s| s.task.is_finished()) else {
            return;
        };
        match finished.task.now_or_never() {
            Some(Ok(FollowEnd::Done)) | None => {
                self.failures.remove(id);
            }
            Some(Ok(FollowEnd::Dropped)) => self.record_failure(id, None),
            Some(Ok(FollowEnd::OpenFailed(e))) => self.record_failure(id, Some(e)),
            Some(Err(e)) => {
                warn!(transfer_id = %id, "Subscription task ended abnormally: {}", e);
                self.record_failure(id, None);
            }
        }
    }

    fn reap_finished(&self) {
        let finished: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.task.is_finished())
            .map(|entry| entry.key().clone())
            .collect();
        for id in finished {
            self.reap(&id);
        }
    }

    /// `error` is `None` when an open connection dropped, which starts the count over
    fn record_failure(&self, id: &str, error: Option<TrackerError>) {
        let mut failures = self.failures.entry(id.to_string()).or_insert(OpenFailures {
            attempts: 0,
            retry_at: None,
        });
        let attempts = match error {
            Some(_) => failures.attempts + 1,
            None => 1,
        };
        failures.attempts = attempts;

        let give_up = error
            .as_ref()
            .is_some_and(|e| !e.is_retryable() || failures.attempts >= MAX_OPEN_ATTEMPTS);
        if give_up {
            failures.retry_at = None;
            warn!(
                transfer_id = %id,
                attempts = failures.attempts,
                "Giving up on subscription, history polling and the sweeper still cover this transfer"
            );
        } else {
            let delay = retry_delay(failures.attempts);
            failures.retry_at = Some(self.clock.now() + delay);
            debug!(
                transfer_id = %id,
                attempts = failures.attempts,
                "Subscription will be retried in {}s",
                delay.num_seconds()
            );
        }
    }

    /// Open a subscription for `record` unless it is ineligible, already open
    /// or waiting out earlier open failures.
    /// Returns whether a new subscription was started.
    pub fn subscribe(&self, record: TransferRecord) -> bool {
        if !self.matches(&record) {
            return false;
        }
        self.reap(&record.id);
        if self.is_subscribed(&record.id) || self.backing_off(&record.id) {
            return false;
        }
        let (Some(origin), Some(destination)) = (
            record.source_chain.routing_id,
            record.destination_chain.routing_id,
        ) else {
            return false;
        };

        let params = SubscriptionParams {
            subscription_id: Uuid::new_v4(),
            origin_routing_id: origin,
            destination_routing_id: destination,
            sender_filter: SenderFilter::Any,
        };
        let subscription_id = params.subscription_id;
        let id = record.id.clone();

        let task = tokio::spawn(follow(
            self.transport.clone(),
            params,
            record,
            self.events.clone(),
        ));

        if let Some(previous) = self.active.insert(
            id.clone(),
            ActiveSubscription {
                subscription_id,
                task,
            },
        ) {
            previous.task.abort();
        }

        debug!(transfer_id = %id, %subscription_id, "Subscription opened");
        self.publish_active();
        true
    }

    /// Close the subscription for a transfer, if any, and forget its failures
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.failures.remove(id);
        match self.active.remove(id) {
            Some((_, subscription)) => {
                subscription.task.abort();
                debug!(
                    transfer_id = %id,
                    subscription_id = %subscription.subscription_id,
                    "Subscription closed"
                );
                self.publish_active();
                true
            }
            None => false,
        }
    }

    /// Bring open subscriptions in line with the ongoing collection.
    ///
    /// Subscriptions whose connection ended are reopened here once their
    /// backoff has passed.
    pub async fn sync(&self) {
        let ongoing = self.store.list_ongoing().await;
        self.reap_finished();

        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|entry| !ongoing.iter().any(|r| &r.id == entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            self.unsubscribe(&id);
        }
        self.failures
            .retain(|id, _| ongoing.iter().any(|r| &r.id == id));

        for record in ongoing {
            self.subscribe(record);
        }
        self.publish_active();
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unsubscribe(&id);
        }
    }

    async fn on_change(&self, change: StoreChange) {
        match change {
            StoreChange::Upserted(id) => {
                if let Some(record) = self.store.get_ongoing(&id).await {
                    self.subscribe(record);
                }
            }
            StoreChange::Removed(id) | StoreChange::Completed(id) => {
                self.unsubscribe(&id);
            }
        }
    }

    /// Supervisor loop: follows store changes and resyncs on a cadence
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.subscribe_changes();
        let mut resync = interval(self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Subscription supervisor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}

                change = changes.recv() => match change {
                    Ok(change) => self.on_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Missed {} store changes, resyncing", skipped);
                        self.sync().await;
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = resync.tick() => self.sync().await,
            }
        }

        self.close_all();
        info!("Subscription supervisor stopped");
    }
}

/// Forward correlated notifications for one transfer until a terminal one
async fn follow<T: SubscriptionTransport>(
    transport: Arc<T>,
    params: SubscriptionParams,
    record: TransferRecord,
    events: mpsc::Sender<StatusEvent>,
) -> FollowEnd {
    let mut stream = match transport.open(params).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(transfer_id = %record.id, "Failed to open subscription: {}", e);
            crate::metrics::record_source_error(SignalSource::Subscription, &e);
            return FollowEnd::OpenFailed(e);
        }
    };

    while let Some(received) = stream.recv().await {
        let event = match received.and_then(XcmEvent::try_from) {
            Ok(event) => event,
            Err(e @ TrackerError::Decode { .. }) => {
                warn!(transfer_id = %record.id, "Ignoring undecodable notification: {}", e);
                crate::metrics::record_source_error(SignalSource::Subscription, &e);
                continue;
            }
            Err(e) => {
                let e = TrackerError::Subscription {
                    transfer_id: record.id.clone(),
                    message: e.to_string(),
                };
                warn!("{}", e);
                crate::metrics::record_source_error(SignalSource::Subscription, &e);
                return FollowEnd::Dropped;
            }
        };

        if !event.correlates(&record) {
            continue;
        }

        let status = event.into_status(&record);
        let terminal = status.is_terminal();
        if events.send(status).await.is_err() {
            return FollowEnd::Done;
        }
        if terminal {
            debug!(transfer_id = %record.id, "Terminal notification, closing subscription");
            return FollowEnd::Done;
        }
    }
    FollowEnd::Dropped
}
