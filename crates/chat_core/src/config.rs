use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths::config_json_path;

const CONFIG_FILE_PATH: &str = "config.toml";

/// Top-level configuration for the network layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub api_base: String,
    /// Timeout for generic calls, in milliseconds.
    pub request_timeout_ms: u64,
    /// Timeout for chat-class calls (path contains `/chat`), in milliseconds.
    pub chat_timeout_ms: u64,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub throttle: ThrottleConfig,
    pub tracker: TrackerConfig,
    pub endpoints: EndpointConfig,
    /// Start in offline mode (connectivity monitor reports disconnected).
    pub start_offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_retries: u32,
    pub max_age_secs: u64,
    pub storage_key: String,
    pub stats_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_delay_ms: u64,
    pub max_wait_ms: u64,
    pub stats_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub temperature: f32,
    pub n_predict: u32,
    pub stop: Vec<String>,
    /// Hard wall-clock budget for one streaming call, in milliseconds.
    pub hard_timeout_ms: u64,
    pub legacy_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub short_content_chars: usize,
    pub long_content_chars: usize,
    pub tiny_fragment_chars: usize,
    /// Surface one in `long_sample_every` tiny fragments once content is long.
    pub long_sample_every: u32,
    /// Surface one in `medium_sample_every` tiny fragments in between.
    pub medium_sample_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Delay before a new execution is shown as executing.
    pub start_delay_ms: u64,
    /// Executions with no completion marker are assumed done after this long.
    pub auto_complete_ms: u64,
    pub max_executions: usize,
    /// Tools whose completion is handed to the result aggregator.
    pub handoff_tools: Vec<String>,
}

/// Paths and endpoint classification lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub chat_stream: String,
    pub chat_legacy: String,
    pub batch: String,
    pub offline_replay: String,
    /// Endpoints that never receive a bearer token.
    pub auth_prefixes: Vec<String>,
    /// Endpoints whose 401 responses must not log the user out.
    pub logout_allow_list: Vec<String>,
    pub health_prefixes: Vec<String>,
    /// Substrings marking emotion-logging endpoints (queued with high priority).
    pub emotion_markers: Vec<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000/api".to_string(),
            request_timeout_ms: 30_000,
            chat_timeout_ms: 120_000,
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            batch: BatchConfig::default(),
            stream: StreamConfig::default(),
            throttle: ThrottleConfig::default(),
            tracker: TrackerConfig::default(),
            endpoints: EndpointConfig::default(),
            start_offline: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_retries: 3,
            max_age_secs: 7 * 24 * 60 * 60,
            storage_key: "offline_request_queue".to_string(),
            stats_key: "offline_queue_stats".to_string(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_delay_ms: 100,
            max_wait_ms: 500,
            stats_key: "batch_request_stats".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            n_predict: 512,
            stop: vec!["</s>".to_string(), "User:".to_string()],
            hard_timeout_ms: 120_000,
            legacy_fallback: true,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            short_content_chars: 50,
            long_content_chars: 500,
            tiny_fragment_chars: 15,
            long_sample_every: 5,
            medium_sample_every: 2,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: 100,
            auto_complete_ms: 1_500,
            max_executions: 50,
            handoff_tools: vec!["music_recommendation".to_string()],
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            chat_stream: "/chat/stream".to_string(),
            chat_legacy: "/chat".to_string(),
            batch: "/batch".to_string(),
            offline_replay: "/offline/replay".to_string(),
            auth_prefixes: vec![
                "/auth".to_string(),
                "/login".to_string(),
                "/register".to_string(),
                "/token/refresh".to_string(),
            ],
            logout_allow_list: vec![
                "/sentiment".to_string(),
                "/llm-analytics".to_string(),
                "/personality/recommendations".to_string(),
                "/emotional-state".to_string(),
                "/cloud-events".to_string(),
                "/personality/rapid-update".to_string(),
            ],
            health_prefixes: vec!["/health".to_string()],
            emotion_markers: vec!["/emotion".to_string()],
        }
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl NetConfig {
    /// Load configuration: `~/.chatnet/config.json`, else `./config.toml`,
    /// else defaults; environment variables override either.
    pub fn load() -> Self {
        let mut config = Self::default();

        let mut loaded = false;
        let json_path = config_json_path();
        if json_path.exists() {
            match std::fs::read_to_string(&json_path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<NetConfig>(&content).map_err(|e| e.to_string())
                }) {
                Ok(file_config) => {
                    config = file_config;
                    loaded = true;
                }
                Err(err) => log::warn!("Ignoring {}: {}", json_path.display(), err),
            }
        }

        if !loaded && Path::new(CONFIG_FILE_PATH).exists() {
            if let Ok(content) = std::fs::read_to_string(CONFIG_FILE_PATH) {
                match toml::from_str::<NetConfig>(&content) {
                    Ok(file_config) => config = file_config,
                    Err(err) => log::warn!("Ignoring {}: {}", CONFIG_FILE_PATH, err),
                }
            }
        }

        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(api_base) = std::env::var("API_BASE") {
            self.api_base = api_base;
        }
        if let Some(ms) = env_u64("CHAT_NET_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("CHAT_NET_CHAT_TIMEOUT_MS") {
            self.chat_timeout_ms = ms;
        }
        if let Ok(offline) = std::env::var("CHAT_NET_OFFLINE") {
            self.start_offline = parse_bool_env(&offline);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_millis(self.chat_timeout_ms)
    }

    /// Join the base URL and an endpoint path.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let base = self.api_base.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{base}{endpoint}")
        } else {
            format!("{base}/{endpoint}")
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_env_true_values() {
        for value in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert!(parse_bool_env(value), "value {value:?} should be true");
        }
    }

    #[test]
    fn parse_bool_env_false_values() {
        for value in ["0", "false", "no", "off", "", "  "] {
            assert!(!parse_bool_env(value), "value {value:?} should be false");
        }
    }

    #[test]
    fn url_for_joins_slashes() {
        let mut config = NetConfig::default();
        config.api_base = "https://example.com/api/".to_string();
        assert_eq!(config.url_for("/chat"), "https://example.com/api/chat");
        assert_eq!(config.url_for("chat"), "https://example.com/api/chat");
        assert_eq!(config.url_for("https://other/x"), "https://other/x");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: NetConfig = toml::from_str(
            r#"
            api_base = "https://chat.example"
            [batch]
            max_batch_size = 4
            "#,
        )
        .expect("toml");
        assert_eq!(config.api_base, "https://chat.example");
        assert_eq!(config.batch.max_batch_size, 4);
        assert_eq!(config.batch.batch_delay_ms, 100);
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.retry.max_delay_ms, 5_000);
    }
}
