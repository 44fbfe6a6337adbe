use serde::{Deserialize, Serialize};

use crate::models::RequestPriority;

/// Events published by the dispatcher and the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// A 401 outside the allow-list ended the session.
    SessionExpired { endpoint: String },

    RetryScheduled {
        endpoint: String,
        attempt: u32,
        delay_ms: u64,
    },

    RequestQueued {
        id: String,
        endpoint: String,
        priority: RequestPriority,
    },

    /// A request left the offline queue without being delivered.
    RequestDropped { endpoint: String, reason: String },

    QueueProcessed {
        processed: usize,
        failed: usize,
        dropped: usize,
    },
}
