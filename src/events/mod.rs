//! Status events emitted by the sources and the staleness sweeper
//!
//! Producers never touch the store; they describe what they observed and
//! the reconciler decides what it means for the record.

use crate::transfer::{HandleKind, Outcome};

use serde::Serialize;
use std::fmt;

/// Which producer observed the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    History,
    Subscription,
    Swap,
    Sweeper,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::History => "history",
            SignalSource::Subscription => "subscription",
            SignalSource::Swap => "swap",
            SignalSource::Sweeper => "sweeper",
        }
    }

    /// Rank used by the source-precedence conflict policy, lower wins
    pub fn precedence(&self) -> u8 {
        match self {
            SignalSource::Subscription => 0,
            SignalSource::Swap => 1,
            SignalSource::History => 2,
            SignalSource::Sweeper => 3,
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the reconciler finds the record an event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    Id(String),
    Handle { kind: HandleKind, value: String },
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTarget::Id(id) => f.write_str(id),
            EventTarget::Handle { kind, value } => write!(f, "{}={}", kind.as_str(), value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Transfer is still moving, only the progress label changes
    Progress { label: String },
    /// Transfer reached a final state
    Terminal {
        outcome: Outcome,
        label: String,
        error_detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub source: SignalSource,
    pub target: EventTarget,
    pub signal: Signal,
    /// Correlation handle discovered while producing this event
    pub discovered: Option<(HandleKind, String)>,
}

impl StatusEvent {
    pub fn progress(source: SignalSource, target: EventTarget, label: impl Into<String>) -> Self {
        Self {
            source,
            target,
            signal: Signal::Progress {
                label: label.into(),
            },
            discovered: None,
        }
    }

    pub fn terminal(
        source: SignalSource,
        target: EventTarget,
        outcome: Outcome,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            signal: Signal::Terminal {
                outcome,
                label: label.into(),
                error_detail: None,
            },
            discovered: None,
        }
    }

    pub fn with_handle(mut self, kind: HandleKind, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.discovered = Some((kind, value));
        }
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        if let Signal::Terminal { error_detail, .. } = &mut self.signal {
            *error_detail = Some(detail.into());
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.signal, Signal::Terminal { .. })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match &self.signal {
            Signal::Terminal { outcome, .. } => Some(*outcome),
            Signal::Progress { .. } => None,
        }
    }
}
