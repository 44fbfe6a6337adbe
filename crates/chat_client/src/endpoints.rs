//! Endpoint classification: which calls carry a token, which 401s log the
//! user out, which failures are parked for offline replay.

use chat_core::EndpointConfig;

use crate::models::{HttpMethod, RequestPriority};

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    config: EndpointConfig,
}

/// Path component of an endpoint, without scheme, host or query string.
fn path_of(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    let path = match without_scheme {
        Some(rest) => rest.find('/').map(|idx| &rest[idx..]).unwrap_or("/"),
        None => endpoint,
    };
    path.split(['?', '#']).next().unwrap_or(path)
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl EndpointPolicy {
    pub fn new(config: EndpointConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Login, registration and token refresh never receive a bearer token.
    pub fn is_auth(&self, endpoint: &str) -> bool {
        let path = path_of(endpoint);
        path.contains("/auth/")
            || self
                .config
                .auth_prefixes
                .iter()
                .any(|prefix| matches_prefix(path, prefix))
    }

    pub fn is_health(&self, endpoint: &str) -> bool {
        let path = path_of(endpoint);
        self.config
            .health_prefixes
            .iter()
            .any(|prefix| matches_prefix(path, prefix))
    }

    pub fn is_chat(&self, endpoint: &str) -> bool {
        path_of(endpoint).contains("/chat")
    }

    /// A 401 from these endpoints is reported to the caller but does not end the session.
    pub fn suppresses_logout(&self, endpoint: &str) -> bool {
        let path = path_of(endpoint);
        self.is_auth(endpoint)
            || self
                .config
                .logout_allow_list
                .iter()
                .any(|entry| path.contains(entry.as_str()))
    }

    fn is_internal(&self, endpoint: &str) -> bool {
        let path = path_of(endpoint);
        matches_prefix(path, &self.config.batch) || matches_prefix(path, &self.config.offline_replay)
    }

    /// Mutations outside auth, health and the layer's own batch/replay calls
    /// are parked for replay once their retries are exhausted.
    pub fn is_queueable(&self, method: HttpMethod, endpoint: &str) -> bool {
        method.is_mutating()
            && !self.is_auth(endpoint)
            && !self.is_health(endpoint)
            && !self.is_internal(endpoint)
    }

    pub fn queue_priority(&self, endpoint: &str) -> RequestPriority {
        let path = path_of(endpoint);
        if self
            .config
            .emotion_markers
            .iter()
            .any(|marker| path.contains(marker.as_str()))
        {
            RequestPriority::High
        } else {
            RequestPriority::Normal
        }
    }
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}
