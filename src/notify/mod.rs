//! User notifications, transfer metrics and error capture
//!
//! Calls are fire-and-forget: the reconciler never waits on or inspects
//! what a notifier does with them.

use crate::error::TrackerError;
use crate::transfer::{CompletedTransfer, Direction, Outcome};

use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    pub dismissible: bool,
}

impl Notification {
    /// The single user-facing message for a finalized transfer
    pub fn for_completed(completed: &CompletedTransfer) -> Self {
        let transfer = &completed.transfer;
        let route = format!(
            "{} to {}",
            transfer.source_chain.name, transfer.destination_chain.name
        );
        let (severity, message) = match completed.outcome {
            Outcome::Succeeded => (Severity::Success, format!("Transfer from {route} completed")),
            Outcome::Failed => {
                let reason = completed
                    .error_detail
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                (Severity::Error, format!("Transfer from {route} failed{reason}"))
            }
            Outcome::Unknown => (
                Severity::Warning,
                format!("Transfer from {route} could not be confirmed, check the explorer"),
            ),
        };

        Self {
            severity,
            message,
            dismissible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferMetric {
    pub id: String,
    pub outcome: Outcome,
    pub direction: Direction,
    pub latency_secs: f64,
}

impl TransferMetric {
    pub fn for_completed(completed: &CompletedTransfer) -> Self {
        let latency = completed.finalized_at - completed.transfer.submitted_at;
        Self {
            id: completed.transfer.id.clone(),
            outcome: completed.outcome,
            direction: completed.transfer.direction,
            latency_secs: latency.num_milliseconds().max(0) as f64 / 1000.0,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    fn record_metric(&self, metric: TransferMetric);

    fn capture_error(&self, context: &str, error: &TrackerError);
}

/// Notifier that writes to the log and Prometheus
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Success | Severity::Info => info!(
                severity = ?notification.severity,
                dismissible = notification.dismissible,
                "{}",
                notification.message
            ),
            Severity::Warning | Severity::Error => warn!(
                severity = ?notification.severity,
                dismissible = notification.dismissible,
                "{}",
                notification.message
            ),
        }
    }

    fn record_metric(&self, metric: TransferMetric) {
        crate::metrics::record_transfer_finalized(metric.direction, metric.outcome, metric.latency_secs);
    }

    fn capture_error(&self, context: &str, err: &TrackerError) {
        error!(context = context, kind = err.kind(), "{}", err);
        crate::metrics::record_captured_error(err.kind());
    }
}
