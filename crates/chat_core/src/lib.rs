//! chat_core - Shared configuration and collaborator contracts for the
//! chat network layer
//!
//! - `config` - `NetConfig` and its nested sections
//! - `auth` / `connectivity` / `storage` - collaborators the layer consumes
//! - `events` - typed publish/subscribe topics

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod paths;
pub mod storage;

pub use auth::{LoggingSessionObserver, SessionObserver, StaticTokenProvider, TokenProvider};
pub use config::{
    BatchConfig, EndpointConfig, NetConfig, QueueConfig, RetryConfig, StreamConfig,
    ThrottleConfig, TrackerConfig,
};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use error::StorageError;
pub use events::Topic;
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
