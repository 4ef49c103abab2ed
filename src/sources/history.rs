//! Batched polling of the bridge transfer history API
//!
//! Every cycle sends all ongoing transfers in one request. Entries
//! in the response are matched back to transfers by transaction hash or by
//! the relayed message id, and each entry is decoded on its own so one bad
//! entry never sinks the batch.

use super::poller::PollingSource;
use super::same_hash;
use crate::config::HistoryConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::events::{EventTarget, SignalSource, StatusEvent};
use crate::transfer::{HandleKind, Outcome, TrackingHandles, TransferRecord};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const SOURCE_NAME: &str = "history";

/// One transfer in the outbound batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub id: String,
    pub source_chain: String,
    pub destination_chain: String,
    pub sender: String,
    pub recipient: String,
    pub tracking_handles: TrackingHandles,
}

impl From<&TransferRecord> for HistoryQuery {
    fn from(record: &TransferRecord) -> Self {
        Self {
            id: record.id.clone(),
            source_chain: record.source_chain.uid.clone(),
            destination_chain: record.destination_chain.uid.clone(),
            sender: record.sender.clone(),
            recipient: record.recipient.clone(),
            tracking_handles: record.tracking_handles.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveredHandle {
    pub kind: HandleKind,
    pub value: String,
}

/// One entry of the history response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub match_key: String,
    pub status_label: String,
    pub terminal: bool,
    #[serde(default)]
    pub outcome: Option<HistoryOutcome>,
    #[serde(default)]
    pub new_handle: Option<DiscoveredHandle>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transport for the history API, returns raw entries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryClient: Send + Sync {
    async fn query(&self, batch: Vec<HistoryQuery>) -> TrackerResult<Vec<serde_json::Value>>;
}

#[derive(Serialize)]
struct HistoryRequest {
    transfers: Vec<HistoryQuery>,
}

#[derive(Clone, Debug)]
pub struct HttpHistoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHistoryClient {
    pub fn new(config: &HistoryConfig) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TrackerError::Config(format!("history client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HistoryClient for HttpHistoryClient {
    async fn query(&self, batch: Vec<HistoryQuery>) -> TrackerResult<Vec<serde_json::Value>> {
        let url = format!("{}/transfers/status", self.base_url);
        let body: serde_json::Value = self
            .client
            .post(&url)
            .json(&HistoryRequest { transfers: batch })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TrackerError::http(SOURCE_NAME, e))?
            .json()
            .await
            .map_err(|e| TrackerError::Decode {
                what: "history response",
                message: e.to_string(),
            })?;

        // Accept both a bare array and `{ "transfers": [...] }`
        match body {
            serde_json::Value::Array(entries) => Ok(entries),
            serde_json::Value::Object(mut map) => match map.remove("transfers") {
                Some(serde_json::Value::Array(entries)) => Ok(entries),
                _ => Err(TrackerError::Decode {
                    what: "history response",
                    message: "missing transfers array".into(),
                }),
            },
            _ => Err(TrackerError::Decode {
                what: "history response",
                message: "expected array or object".into(),
            }),
        }
    }
}

pub struct HistorySource<C> {
    client: C,
}

impl<C: HistoryClient> HistorySource<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn find_record<'a>(
        records: &'a [TransferRecord],
        match_key: &str,
    ) -> Option<&'a TransferRecord> {
        records.iter().find(|r| same_hash(&r.id, match_key)).or_else(|| {
            records.iter().find(|r| {
                r.tracking_handles
                    .get(HandleKind::MessageId)
                    .is_some_and(|id| same_hash(id, match_key))
            })
        })
    }

    fn to_event(record: &TransferRecord, entry: HistoryEntry) -> StatusEvent {
        let target = EventTarget::Id(record.id.clone());
        let mut event = if entry.terminal {
            let outcome = match entry.outcome {
                Some(HistoryOutcome::Success) => Outcome::Succeeded,
                Some(HistoryOutcome::Failed) => Outcome::Failed,
                None => Outcome::Unknown,
            };
            let mut event =
                StatusEvent::terminal(SignalSource::History, target, outcome, entry.status_label);
            if let Some(error) = entry.error {
                event = event.with_error(error);
            }
            event
        } else {
            StatusEvent::progress(SignalSource::History, target, entry.status_label)
        };

        if let Some(handle) = entry.new_handle {
            event = event.with_handle(handle.kind, handle.value);
        }
        event
    }
}

#[async_trait]
impl<C: HistoryClient> PollingSource for HistorySource<C> {
    fn kind(&self) -> SignalSource {
        SignalSource::History
    }

    /// Every pending transfer except a swap that never leaves its chain
    fn matches(&self, record: &TransferRecord) -> bool {
        !record.is_same_chain_swap()
    }

    async fn poll(&self, records: &[TransferRecord]) -> TrackerResult<Vec<StatusEvent>> {
        let batch = records.iter().map(HistoryQuery::from).collect();
        let raw_entries = self.client.query(batch).await?;

        let mut events = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let entry: HistoryEntry = match serde_json::from_value(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping malformed history entry: {}", e);
                    crate::metrics::record_source_error(
                        SignalSource::History,
                        &TrackerError::Decode {
                            what: "history entry",
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            match Self::find_record(records, &entry.match_key) {
                Some(record) => events.push(Self::to_event(record, entry)),
                None => debug!(match_key = %entry.match_key, "History entry matches no ongoing transfer"),
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

    fn bridge_records() -> Vec<TransferRecord> {
        let mut to_polkadot = record("0xAAAA", ethereum(), asset_hub());
        to_polkadot
            .tracking_handles
            .insert(HandleKind::MessageId, "0xm1".into());
        vec![to_polkadot, record("0xbbbb", asset_hub(), ethereum())]
    }

    #[test]
    fn covers_bridges_and_hops_but_not_same_chain_swaps() {
        let source = HistorySource::new(MockHistoryClient::new());
        assert!(source.matches(&record("0x1", ethereum(), asset_hub())));
        assert!(source.matches(&record("0x1", asset_hub(), ethereum())));
        assert!(source.matches(&record("0x1", hydration(), asset_hub())));

        let mut swap = record("0x2", hydration(), hydration());
        swap.destination_token = Some(crate::transfer::Token {
            symbol: "USDT".into(),
            decimals: 6,
            address: None,
        });
        assert!(!source.matches(&swap));
    }

    #[tokio::test]
    async fn intra_network_hop_is_sent_in_the_batch() {
        use crate::state::{MemoryPersistence, TransferStore};
        use crate::sources::Poller;
        use std::sync::Arc;
        use tokio::sync::mpsc;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transfers/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "matchKey": "0xhop", "statusLabel": "Received", "terminal": true, "outcome": "success" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(
            TransferStore::open(Arc::new(MemoryPersistence::new()))
                .await
                .unwrap(),
        );
        store
            .track(record("0xhop", hydration(), asset_hub()))
            .await
            .unwrap();

        let client = HttpHistoryClient::new(&HistoryConfig {
            enabled: true,
            base_url: server.uri(),
            poll_interval_secs: 30,
            request_timeout_secs: 5,
        })
        .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let poller = Poller::new(
            HistorySource::new(client),
            store,
            tx,
            std::time::Duration::from_secs(30),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().outcome(), Some(Outcome::Succeeded));

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["transfers"][0]["id"], "0xhop");
        assert_eq!(body["transfers"][0]["sourceChain"], "hydration");
    }

    #[tokio::test]
    async fn malformed_entries_do_not_block_the_batch() {
        let mut client = MockHistoryClient::new();
        client.expect_query().returning(|batch| {
            assert_eq!(batch.len(), 2);
            Ok(vec![
                json!({ "matchKey": "0xaaaa", "statusLabel": "Bridge hub", "terminal": false,
                        "newHandle": { "kind": "parent_block_hash", "value": "0xpb" } }),
                json!({ "statusLabel": "no key here" }),
                json!({ "matchKey": "0xBBBB", "statusLabel": "Complete", "terminal": true, "outcome": "success" }),
                json!({ "matchKey": "0xunknown", "statusLabel": "Complete", "terminal": true }),
            ])
        });

        let events = HistorySource::new(client)
            .poll(&bridge_records())
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].target, EventTarget::Id("0xAAAA".into()));
        assert_eq!(
            events[0].discovered,
            Some((HandleKind::ParentBlockHash, "0xpb".to_string()))
        );
        assert!(!events[0].is_terminal());
        assert_eq!(events[1].target, EventTarget::Id("0xbbbb".into()));
        assert_eq!(events[1].outcome(), Some(Outcome::Succeeded));
    }

    #[tokio::test]
    async fn matches_by_relayed_message_id() {
        let mut client = MockHistoryClient::new();
        client.expect_query().returning(|_| {
            Ok(vec![json!({
                "matchKey": "0xM1", "statusLabel": "Failed", "terminal": true,
                "outcome": "failed", "error": "execution reverted"
            })])
        });

        let events = HistorySource::new(client)
            .poll(&bridge_records())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, EventTarget::Id("0xAAAA".into()));
        assert!(matches!(
            &events[0].signal,
            Signal::Terminal { outcome: Outcome::Failed, error_detail: Some(d), .. } if d == "execution reverted"
        ));
    }

    #[tokio::test]
    async fn http_client_posts_batch_and_unwraps_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transfers/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transfers": [
                    { "matchKey": "0xaaaa", "statusLabel": "Pending", "terminal": false }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpHistoryClient::new(&HistoryConfig {
            enabled: true,
            base_url: format!("{}/", server.uri()),
            poll_interval_secs: 30,
            request_timeout_secs: 5,
        })
        .unwrap();

        let entries = client
            .query(bridge_records().iter().map(HistoryQuery::from).collect())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["transfers"][0]["id"], "0xAAAA");
        assert_eq!(body["transfers"][0]["trackingHandles"]["message_id"], "0xm1");
    }

    #[tokio::test]
    async fn http_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpHistoryClient::new(&HistoryConfig {
            enabled: true,
            base_url: server.uri(),
            poll_interval_secs: 30,
            request_timeout_secs: 5,
        })
        .unwrap();

        let err = client.query(vec![]).await.unwrap_err();
        assert!(matches!(err, TrackerError::HttpStatus { status: 503, .. }));
        assert!(err.is_retryable());
    }
}
