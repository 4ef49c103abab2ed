//! Protocol-specific correlation identifiers discovered after submission

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Bridge message id relayed between Ethereum and Polkadot
    MessageId,
    /// Unique id matched by the push subscription service
    SubscriptionId,
    /// Deposit channel opened with the swap router
    SwapChannel,
    /// Swap id assigned by the swap router once the deposit is seen
    SwapId,
    ParentBlockHash,
    EvmTxHash,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::MessageId => "message_id",
            HandleKind::SubscriptionId => "subscription_id",
            HandleKind::SwapChannel => "swap_channel",
            HandleKind::SwapId => "swap_id",
            HandleKind::ParentBlockHash => "parent_block_hash",
            HandleKind::EvmTxHash => "evm_tx_hash",
        }
    }
}

/// Append-only bag of tracking handles, one value per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingHandles(BTreeMap<HandleKind, String>);

impl TrackingHandles {
    /// Record a handle unless one of that kind already exists.
    /// Returns `true` when the value was written.
    pub fn insert(&mut self, kind: HandleKind, value: String) -> bool {
        if value.is_empty() || self.0.contains_key(&kind) {
            return false;
        }
        self.0.insert(kind, value);
        true
    }

    pub fn get(&self, kind: HandleKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    pub fn contains(&self, kind: HandleKind) -> bool {
        self.0.contains_key(&kind)
    }

    /// Union with `other`, keeping existing entries
    pub fn union(&mut self, other: &TrackingHandles) {
        for (kind, value) in &other.0 {
            self.insert(*kind, value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
