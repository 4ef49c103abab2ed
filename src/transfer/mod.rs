//! Transfer data model
//!
//! A transfer enters the tracker as a `TransferRecord` once it has been
//! submitted on its source chain. It stays `Pending` in the ongoing
//! collection until exactly one terminal signal moves it to `completed`
//! as a `CompletedTransfer`.

mod chain;
mod handles;

pub use chain::{Chain, Direction, Network};
pub use handles::{HandleKind, TrackingHandles};

use crate::error::{TrackerError, TrackerResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token descriptor as reported by the submission backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub address: Option<String>,
}

/// Final outcome of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    /// No source reported a definitive result before the record went stale
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Completed(Outcome),
}

impl LifecycleState {
    pub fn is_pending(&self) -> bool {
        matches!(self, LifecycleState::Pending)
    }
}

/// What the submission subsystem hands over once a transfer is on chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransfer {
    pub id: String,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    #[serde(default)]
    pub source_token: Option<Token>,
    #[serde(default)]
    pub destination_token: Option<Token>,
    #[serde(default)]
    pub source_amount: Option<String>,
    #[serde(default)]
    pub destination_amount: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub tracking_handles: TrackingHandles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    pub source_token: Option<Token>,
    pub destination_token: Option<Token>,
    pub source_amount: Option<String>,
    pub destination_amount: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub submitted_at: DateTime<Utc>,
    pub direction: Direction,
    pub tracking_handles: TrackingHandles,
    pub status: String,
    pub lifecycle: LifecycleState,
}

impl TransferRecord {
    /// Take ownership of a freshly submitted transfer
    pub fn from_submission(new: NewTransfer) -> TrackerResult<Self> {
        if new.id.trim().is_empty() {
            return Err(TrackerError::InvalidTransfer("empty transfer id".into()));
        }
        if new.sender.trim().is_empty() || new.recipient.trim().is_empty() {
            return Err(TrackerError::InvalidTransfer(format!(
                "transfer {} is missing sender or recipient",
                new.id
            )));
        }

        let direction = Direction::resolve(&new.source_chain, &new.destination_chain);

        Ok(Self {
            id: new.id,
            source_chain: new.source_chain,
            destination_chain: new.destination_chain,
            source_token: new.source_token,
            destination_token: new.destination_token,
            source_amount: new.source_amount,
            destination_amount: new.destination_amount,
            sender: new.sender,
            recipient: new.recipient,
            submitted_at: new.submitted_at,
            direction,
            tracking_handles: new.tracking_handles,
            status: "Submitted".to_string(),
            lifecycle: LifecycleState::Pending,
        })
    }

    pub fn is_swap(&self) -> bool {
        self.destination_token.is_some()
    }

    /// A swap that starts and ends on the same chain never crosses a hop
    pub fn is_same_chain_swap(&self) -> bool {
        self.is_swap() && self.source_chain.uid == self.destination_chain.uid
    }

    /// Merge a newer copy of the same transfer into this one.
    ///
    /// Identity fields (`id`, both chains, `submitted_at`, `direction`) never
    /// change and tracking handles are unioned with first-writer-wins per kind.
    pub fn merge_from(&mut self, newer: TransferRecord) {
        debug_assert_eq!(self.id, newer.id);

        if newer.source_token.is_some() {
            self.source_token = newer.source_token;
        }
        if newer.destination_token.is_some() {
            self.destination_token = newer.destination_token;
        }
        if newer.source_amount.is_some() {
            self.source_amount = newer.source_amount;
        }
        if newer.destination_amount.is_some() {
            self.destination_amount = newer.destination_amount;
        }
        self.sender = newer.sender;
        self.recipient = newer.recipient;
        if !newer.status.is_empty() {
            self.status = newer.status;
        }
        self.tracking_handles.union(&newer.tracking_handles);
    }
}

/// Immutable snapshot of a finalized transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTransfer {
    pub transfer: TransferRecord,
    pub outcome: Outcome,
    pub finalized_at: DateTime<Utc>,
    pub explorer_link: Option<String>,
    pub error_detail: Option<String>,
}

impl CompletedTransfer {
    pub fn finalize(
        mut transfer: TransferRecord,
        outcome: Outcome,
        finalized_at: DateTime<Utc>,
        error_detail: Option<String>,
    ) -> Self {
        transfer.lifecycle = LifecycleState::Completed(outcome);
        let explorer_link = transfer.source_chain.explorer_tx_url(&transfer.id);

        Self {
            transfer,
            outcome,
            finalized_at,
            explorer_link,
            error_detail,
        }
    }

    pub fn id(&self) -> &str {
        &self.transfer.id
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn submission_derives_direction_and_starts_pending() {
        let record = record("0xabc", ethereum(), asset_hub());
        assert_eq!(record.direction, Direction::ToPolkadot);
        assert!(record.lifecycle.is_pending());
        assert_eq!(record.status, "Submitted");
    }

    #[test]
    fn rejects_submission_without_id() {
        let mut new = NewTransfer {
            id: " ".into(),
            source_chain: hydration(),
            destination_chain: asset_hub(),
            source_token: None,
            destination_token: None,
            source_amount: None,
            destination_amount: None,
            sender: "a".into(),
            recipient: "b".into(),
            submitted_at: submitted_at(),
            tracking_handles: TrackingHandles::default(),
        };
        assert!(TransferRecord::from_submission(new.clone()).is_err());
        new.id = "0x1".into();
        assert!(TransferRecord::from_submission(new).is_ok());
    }

    #[test]
    fn merge_keeps_identity_and_first_handles() {
        let mut stored = record("0x1", hydration(), asset_hub());
        stored
            .tracking_handles
            .insert(HandleKind::MessageId, "0xfirst".into());

        let mut newer = stored.clone();
        newer.direction = Direction::ToEthereum;
        newer.status = "Relayed".into();
        newer.tracking_handles = TrackingHandles::default();
        newer
            .tracking_handles
            .insert(HandleKind::MessageId, "0xsecond".into());
        newer
            .tracking_handles
            .insert(HandleKind::SubscriptionId, "sub-1".into());

        stored.merge_from(newer);
        assert_eq!(stored.direction, Direction::WithinPolkadot);
        assert_eq!(stored.status, "Relayed");
        assert_eq!(stored.tracking_handles.get(HandleKind::MessageId), Some("0xfirst"));
        assert_eq!(stored.tracking_handles.get(HandleKind::SubscriptionId), Some("sub-1"));
    }

    #[test]
    fn merge_never_moves_a_transfer_between_chains() {
        let mut stored = record("0x1", hydration(), asset_hub());
        let mut newer = record("0x1", asset_hub(), ethereum());
        newer.sender = "updated-sender".into();

        stored.merge_from(newer);
        assert_eq!(stored.source_chain, hydration());
        assert_eq!(stored.destination_chain, asset_hub());
        assert_eq!(stored.direction, Direction::WithinPolkadot);
        assert_eq!(stored.direction, Direction::resolve(&stored.source_chain, &stored.destination_chain));
        assert_eq!(stored.sender, "updated-sender");
    }

    #[test]
    fn same_chain_swap_detection() {
        let mut record = record("0x2", hydration(), hydration());
        assert!(!record.is_same_chain_swap());
        record.destination_token = Some(Token {
            symbol: "USDC".into(),
            decimals: 6,
            address: None,
        });
        assert!(record.is_same_chain_swap());
    }

    #[test]
    fn finalize_marks_snapshot_completed() {
        let record = record("0xdead", ethereum(), asset_hub());
        let completed =
            CompletedTransfer::finalize(record, Outcome::Failed, submitted_at(), Some("boom".into()));
        assert_eq!(completed.transfer.lifecycle, LifecycleState::Completed(Outcome::Failed));
        assert_eq!(
            completed.explorer_link.as_deref(),
            Some("https://etherscan.io/tx/0xdead")
        );
    }
}
