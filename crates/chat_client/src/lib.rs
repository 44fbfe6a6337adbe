//! chat_client - Resilient request plumbing for the chat network layer
//!
//! - `transport` - reqwest client with bearer-token middleware and timeouts
//! - `dispatcher` - retry/backoff, 401 logout policy, offline handoff
//! - `offline_queue` - durable priority queue replayed on reconnect
//! - `batch` - debounced coalescing of reads into batch calls

pub mod batch;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod models;
pub mod offline_queue;
pub mod retry;
pub mod transport;

pub use batch::{BatchCoalescer, BatchError, BatchItemResult, BatchRequest, BatchResponse, BatchStats};
pub use dispatcher::RequestDispatcher;
pub use endpoints::EndpointPolicy;
pub use error::{NetError, Result};
pub use events::NetworkEvent;
pub use models::{ApiRequest, ApiResponse, HttpMethod, RequestPriority};
pub use offline_queue::{
    OfflineQueue, QueueStats, QueuedRequest, ReplayMode, ReplaySummary, RequestOptions,
};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, RequestSender};
