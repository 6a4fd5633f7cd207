//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-state engine configuration.
///
/// Serializable so applications can embed it in their own settings file.
/// Missing fields fall back to [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Whether edits count as unread items.
    pub count_edits: bool,
    /// Whether state events flagged as notifying count as unread items.
    pub count_notifying_state_events: bool,
    /// Whether the local user's own events implicitly mark their scope read.
    pub own_events_mark_read: bool,
    /// Send public receipts. When false, only private receipts are sent.
    pub send_public_receipts: bool,
    /// Delay before a queued receipt is released. Zero sends immediately.
    pub receipt_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            count_edits: false,
            count_notifying_state_events: true,
            own_events_mark_read: true,
            send_public_receipts: true,
            receipt_debounce: Duration::ZERO,
        }
    }
}
