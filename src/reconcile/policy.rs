//! Ordering of events inside one reconciliation tick

use crate::events::StatusEvent;

use serde::Deserialize;

/// How terminal signals for the same transfer are ranked within a tick.
///
/// Either way the first terminal event applied wins and later ones are
/// discarded; the policy only decides which one is applied first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Receipt order
    #[default]
    FirstWins,
    /// Progress first, then terminal events ranked by source
    /// (subscription, swap, history, sweeper)
    SourcePrecedence,
}

impl ConflictPolicy {
    pub fn order(&self, mut batch: Vec<StatusEvent>) -> Vec<StatusEvent> {
        match self {
            ConflictPolicy::FirstWins => batch,
            ConflictPolicy::SourcePrecedence => {
                // sort_by_key is stable, receipt order survives within a rank
                batch.sort_by_key(|event| {
                    if event.is_terminal() {
                        (1u8, event.source.precedence())
                    } else {
                        (0u8, 0u8)
                    }
                });
                batch
            }
        }
    }
}
