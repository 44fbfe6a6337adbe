use thiserror::Error;

/// Failure taxonomy of the network layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Session expired (401 from {endpoint})")]
    AuthExpired { endpoint: String },

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Offline queue is full")]
    Capacity,

    /// The mutation exhausted its retries and was parked for offline replay.
    #[error("Request queued for replay ({request_id})")]
    Queued { request_id: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl NetError {
    /// Network failures, timeouts and 5xx responses are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Server { .. } | Self::Timeout { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::AuthExpired { .. } => Some(401),
            _ => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network(_) | Self::Timeout { .. } => {
                "Unable to reach the server. Check your connection and try again."
            }
            Self::AuthExpired { .. } => "Your session has expired. Please sign in again.",
            Self::Queued { .. } => "You're offline. Your change was saved and will sync later.",
            _ => "Something went wrong. Please try again.",
        }
    }

    pub(crate) fn from_middleware(err: reqwest_middleware::Error, timeout_ms: u64) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => Self::from_reqwest(err, timeout_ms),
            reqwest_middleware::Error::Middleware(err) => Self::Network(err.to_string()),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                after_ms: timeout_ms,
            }
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
