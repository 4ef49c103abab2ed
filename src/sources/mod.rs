//! Status sources
//!
//! This module provides:
//! - Batched polling of the bridge history API
//! - Per-transfer push subscriptions for XCM hops
//! - Per-transfer polling of the swap router status endpoint
//!
//! Sources only emit `StatusEvent`s into the reconciler channel.

pub mod history;
pub mod poller;
pub mod subscription;
pub mod swap;
pub mod ws;

pub use history::{HistorySource, HttpHistoryClient};
pub use poller::{Poller, PollingSource};
pub use subscription::SubscriptionSource;
pub use swap::{HttpSwapClient, SwapSource};
pub use ws::WsTransport;

/// Case-insensitive hash comparison, tolerant of a missing `0x` prefix
pub(crate) fn same_hash(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();
    let strip = |s: &str| -> String {
        s.strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s)
            .to_ascii_lowercase()
    };

    match (hex::decode(strip(a)), hex::decode(strip(b))) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.eq_ignore_ascii_case(b),
    }
}
