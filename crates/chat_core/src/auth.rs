//! Authentication collaborators. Login flows live outside this workspace;
//! the network layer only consumes tokens and reports expired sessions.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Supplies bearer tokens for outgoing requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Option<String>;
}

/// Receives the global logout signal raised by a 401 outside the allow-list.
pub trait SessionObserver: Send + Sync {
    fn on_session_expired(&self, endpoint: &str);
}

/// Token provider backed by a replaceable in-memory value.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }
}

/// Session observer that only counts and logs expirations.
#[derive(Debug, Default)]
pub struct LoggingSessionObserver {
    expirations: AtomicUsize,
}

impl LoggingSessionObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expirations(&self) -> usize {
        self.expirations.load(Ordering::SeqCst)
    }
}

impl SessionObserver for LoggingSessionObserver {
    fn on_session_expired(&self, endpoint: &str) {
        self.expirations.fetch_add(1, Ordering::SeqCst);
        log::warn!("Session expired (401 from {endpoint}); logging out");
    }
}
