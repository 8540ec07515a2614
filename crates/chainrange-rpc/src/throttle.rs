//! Per-endpoint spacing of RPC calls.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::limitations::MinDelay;

/// Remembers when each endpoint is next allowed to be called.
///
/// Callers reserve a slot under the lock and sleep outside of it, so
/// concurrent callers of the same endpoint queue up one delay apart.
#[derive(Debug, Default)]
pub struct CallThrottle {
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl CallThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `url` may be called again given `min_delay`.
    pub async fn wait_turn(&self, url: &str, min_delay: MinDelay) {
        let Some(delay) = min_delay.as_duration() else {
            return;
        };
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(url).copied().filter(|s| *s > now).unwrap_or(now);
            slots.insert(url.to_string(), slot + delay);
            slot
        };
        if slot > Instant::now() {
            trace!(url, wait_ms = (slot - Instant::now()).as_millis() as u64, "throttling rpc call");
            tokio::time::sleep_until(slot).await;
        }
    }
}
