//! Swap router status polling
//!
//! Transfers routed through the swap router carry a deposit channel handle.
//! Each cycle asks the router about every such transfer individually.

use super::poller::PollingSource;
use crate::config::SwapConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventTarget, SignalSource, StatusEvent};
use crate::transfer::{HandleKind, Outcome, TransferRecord};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const SOURCE_NAME: &str = "swap";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Receiving,
    Swapping,
    Sending,
    Sent,
    Completed,
    Failed,
}

impl SwapState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RECEIVING" | "WAITING" => Some(SwapState::Receiving),
            "SWAPPING" => Some(SwapState::Swapping),
            "SENDING" => Some(SwapState::Sending),
            "SENT" => Some(SwapState::Sent),
            "COMPLETED" | "COMPLETE" => Some(SwapState::Completed),
            "FAILED" => Some(SwapState::Failed),
            _ => None,
        }
    }

    pub fn terminal_outcome(&self) -> Option<Outcome> {
        match self {
            SwapState::Completed => Some(Outcome::Succeeded),
            SwapState::Failed => Some(Outcome::Failed),
            SwapState::Receiving | SwapState::Swapping | SwapState::Sending | SwapState::Sent => {
                None
            }
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SwapState::Receiving => "Receiving",
            SwapState::Swapping => "Swapping",
            SwapState::Sending => "Sending",
            SwapState::Sent => "Sent",
            SwapState::Completed => "Completed",
            SwapState::Failed => "Failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapFailure {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status endpoint response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapStatus {
    pub state: String,
    #[serde(default)]
    pub swap_id: Option<String>,
    #[serde(default)]
    pub error: Option<SwapFailure>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapStatusClient: Send + Sync {
    async fn status(&self, channel: &str) -> TrackerResult<SwapStatus>;
}

#[derive(Clone, Debug)]
pub struct HttpSwapClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSwapClient {
    pub fn new(config: &SwapConfig) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TrackerError::Config(format!("swap client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SwapStatusClient for HttpSwapClient {
    async fn status(&self, channel: &str) -> TrackerResult<SwapStatus> {
        let url = format!("{}/swaps/{}", self.base_url, channel);
        self.client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TrackerError::http(SOURCE_NAME, e))?
            .json()
            .await
            .map_err(|e| TrackerError::Decode {
                what: "swap status",
                message: e.to_string(),
            })
    }
}

pub struct SwapSource<C> {
    client: C,
}

impl<C: SwapStatusClient> SwapSource<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn to_event(record: &TransferRecord, status: SwapStatus) -> Option<StatusEvent> {
        let Some(state) = SwapState::parse(&status.state) else {
            warn!(transfer_id = %record.id, state = %status.state, "Unrecognized swap state");
            return None;
        };

        let target = EventTarget::Id(record.id.clone());
        let mut event = match state.terminal_outcome() {
            Some(outcome) => {
                let event =
                    StatusEvent::terminal(SignalSource::Swap, target, outcome, state.to_string());
                if outcome == Outcome::Failed {
                    let detail = status
                        .error
                        .and_then(|e| e.message.or(e.name))
                        .unwrap_or_else(|| "Swap failed".to_string());
                    event.with_error(detail)
                } else {
                    event
                }
            }
            None => StatusEvent::progress(SignalSource::Swap, target, state.to_string()),
        };

        if let Some(swap_id) = status.swap_id {
            event = event.with_handle(HandleKind::SwapId, swap_id);
        }
        Some(event)
    }
}

#[async_trait]
impl<C: SwapStatusClient> PollingSource for SwapSource<C> {
    fn kind(&self) -> SignalSource {
        SignalSource::Swap
    }

    fn matches(&self, record: &TransferRecord) -> bool {
        record.tracking_handles.contains(HandleKind::SwapChannel)
    }

    async fn poll(&self, records: &[TransferRecord]) -> TrackerResult<Vec<StatusEvent>> {
        let requests = records.iter().filter_map(|record| {
            let channel = record.tracking_handles.get(HandleKind::SwapChannel)?;
            Some(async move { (record, self.client.status(channel).await) })
        });

        let mut events = Vec::new();
        for (record, result) in join_all(requests).await {
            match result {
                Ok(status) => {
                    debug!(transfer_id = %record.id, state = %status.state, "Swap status");
                    events.extend(Self::to_event(record, status));
                }
                Err(e) => {
                    warn!(transfer_id = %record.id, "Swap status request failed: {}", e);
                    crate::metrics::record_source_error(SignalSource::Swap, &e);
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Signal;
    use crate::transfer::fixtures::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn swap_record(id: &str, channel: &str) -> TransferRecord {
        let mut record = record(id, ethereum(), asset_hub());
        record
            .tracking_handles
            .insert(HandleKind::SwapChannel, channel.into());
        record
    }

    fn status(state: &str) -> SwapStatus {
        SwapStatus {
            state: state.into(),
            swap_id: None,
            error: None,
        }
    }

    #[test]
    fn state_mapping() {
        for raw in ["RECEIVING", "Swapping", "sending", "SENT"] {
            let state = SwapState::parse(raw).unwrap();
            assert_eq!(state.terminal_outcome(), None);
        }
        assert_eq!(
            SwapState::parse("COMPLETED").unwrap().terminal_outcome(),
            Some(Outcome::Succeeded)
        );
        assert_eq!(
            SwapState::parse("FAILED").unwrap().terminal_outcome(),
            Some(Outcome::Failed)
        );
        assert!(SwapState::parse("EXPLODED").is_none());
    }

    #[test]
    fn only_transfers_with_channel_match() {
        let source = SwapSource::new(MockSwapStatusClient::new());
        assert!(source.matches(&swap_record("0x1", "chan")));
        assert!(!source.matches(&record("0x2", ethereum(), asset_hub())));
    }

    #[tokio::test]
    async fn failed_swap_is_terminal_with_detail() {
        let mut client = MockSwapStatusClient::new();
        client.expect_status().returning(|_| {
            Ok(SwapStatus {
                state: "FAILED".into(),
                swap_id: Some("881".into()),
                error: Some(SwapFailure {
                    name: Some("SwapFailed".into()),
                    message: Some("Slippage tolerance exceeded".into()),
                }),
            })
        });

        let events = SwapSource::new(client)
            .poll(&[swap_record("0x1", "chan-1")])
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].signal,
            Signal::Terminal { outcome: Outcome::Failed, error_detail: Some(d), .. }
                if d == "Slippage tolerance exceeded"
        ));
        assert_eq!(events[0].discovered, Some((HandleKind::SwapId, "881".into())));
    }

    #[tokio::test]
    async fn failed_swap_finalizes_with_error_notification() {
        use crate::clock::ManualClock;
        use crate::notify::recording::RecordingNotifier;
        use crate::notify::Severity;
        use crate::reconcile::{ApplyOutcome, ConflictPolicy, Reconciler};
        use crate::state::{MemoryPersistence, TransferStore};
        use std::sync::Arc;

        let store = Arc::new(
            TransferStore::open(Arc::new(MemoryPersistence::new()))
                .await
                .unwrap(),
        );
        let record = swap_record("0x5", "chan-5");
        store.track(record.clone()).await.unwrap();

        let mut client = MockSwapStatusClient::new();
        client.expect_status().returning(|_| {
            Ok(SwapStatus {
                state: "FAILED".into(),
                swap_id: None,
                error: Some(SwapFailure {
                    name: Some("RefundEgress".into()),
                    message: None,
                }),
            })
        });
        let events = SwapSource::new(client).poll(&[record]).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = Reconciler::new(
            store.clone(),
            notifier.clone(),
            Arc::new(ManualClock::new(submitted_at())),
            ConflictPolicy::FirstWins,
        );
        assert_eq!(
            reconciler.reconcile_tick(events).await,
            vec![ApplyOutcome::Finalized(Outcome::Failed)]
        );

        let completed = store.get_completed("0x5").await.unwrap();
        assert_eq!(completed.outcome, Outcome::Failed);
        assert_eq!(completed.error_detail.as_deref(), Some("RefundEgress"));
        assert_eq!(notifier.notifications()[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn one_failing_request_does_not_block_others() {
        let mut client = MockSwapStatusClient::new();
        client.expect_status().returning(|channel| match channel {
            "chan-1" => Err(TrackerError::Http {
                source_name: "swap",
                message: "connection refused".into(),
            }),
            _ => Ok(status("SWAPPING")),
        });

        let events = SwapSource::new(client)
            .poll(&[swap_record("0x1", "chan-1"), swap_record("0x2", "chan-2")])
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, EventTarget::Id("0x2".into()));
        assert!(matches!(&events[0].signal, Signal::Progress { label } if label == "Swapping"));
    }

    #[tokio::test]
    async fn http_client_reads_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/swaps/chan-7"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "state": "COMPLETED", "swapId": "12" })),
            )
            .mount(&server)
            .await;

        let client = HttpSwapClient::new(&SwapConfig {
            enabled: true,
            base_url: server.uri(),
            poll_interval_secs: 20,
            request_timeout_secs: 5,
        })
        .unwrap();

        let status = client.status("chan-7").await.unwrap();
        assert_eq!(SwapState::parse(&status.state), Some(SwapState::Completed));
        assert_eq!(status.swap_id.as_deref(), Some("12"));
    }
}
