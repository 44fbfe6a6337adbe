use std::sync::Arc;

use async_trait::async_trait;
use chat_core::{SessionObserver, Topic};
use log::{debug, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::endpoints::EndpointPolicy;
use crate::error::{NetError, Result};
use crate::events::NetworkEvent;
use crate::models::{ApiRequest, ApiResponse, HttpMethod};
use crate::offline_queue::{OfflineQueue, RequestOptions};
use crate::retry::RetryPolicy;
use crate::transport::RequestSender;

/// Issues requests with retry, the 401 logout policy and offline handoff.
///
/// Every failure comes back as a [`NetError`]; nothing escapes as a panic.
pub struct RequestDispatcher {
    transport: Arc<dyn RequestSender>,
    policy: EndpointPolicy,
    retry: RetryPolicy,
    session: Option<Arc<dyn SessionObserver>>,
    queue: Option<Arc<OfflineQueue>>,
    events: Topic<NetworkEvent>,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn RequestSender>, policy: EndpointPolicy, retry: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            retry,
            session: None,
            queue: None,
            events: Topic::default(),
        }
    }

    pub fn with_session_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.session = Some(observer);
        self
    }

    pub fn with_offline_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Topic<NetworkEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Topic<NetworkEvent> {
        &self.events
    }

    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run `request` with up to `retry_attempts` attempts (the configured
    /// default when `None`).
    pub async fn execute(&self, request: ApiRequest, retry_attempts: Option<u32>) -> Result<ApiResponse> {
        self.execute_with_cancel(request, retry_attempts, &CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        request: ApiRequest,
        retry_attempts: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let attempts = retry_attempts.unwrap_or(self.retry.attempts).max(1);
        let mut attempt = 1;

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                outcome = self.transport.send(request.clone()) => outcome,
            };

            let err = match outcome.and_then(|response| self.classify(&request.endpoint, response)) {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("{} {} failed without retry: {}", request.method, request.endpoint, err);
                return Err(err);
            }
            if attempt >= attempts {
                warn!(
                    "{} {} failed after {} attempt(s): {}",
                    request.method, request.endpoint, attempt, err
                );
                return self.hand_off(request, err).await;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            info!(
                "Retrying {} {} in {:?} (attempt {}/{}): {}",
                request.method,
                request.endpoint,
                delay,
                attempt + 1,
                attempts,
                err
            );
            self.events.publish(NetworkEvent::RetryScheduled {
                endpoint: request.endpoint.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Map a response from `endpoint` to success or a typed error, applying
    /// the 401 logout policy. Shared by callers that send outside the retry
    /// loop, such as the chat stream.
    pub fn classify(&self, endpoint: &str, response: ApiResponse) -> Result<ApiResponse> {
        let status = response.status;
        if response.is_success() {
            return Ok(response);
        }
        let message = response.error_message();
        match status {
            401 if self.policy.suppresses_logout(endpoint) => {
                debug!("401 from {} ignored for session purposes", endpoint);
                Err(NetError::Client { status, message })
            }
            401 => {
                warn!("Session expired: 401 from {}", endpoint);
                if let Some(observer) = &self.session {
                    observer.on_session_expired(endpoint);
                }
                self.events.publish(NetworkEvent::SessionExpired {
                    endpoint: endpoint.to_string(),
                });
                Err(NetError::AuthExpired {
                    endpoint: endpoint.to_string(),
                })
            }
            400..=499 => Err(NetError::Client { status, message }),
            500..=599 => Err(NetError::Server { status, message }),
            _ => Err(NetError::Network(format!("Unexpected status {status}: {message}"))),
        }
    }

    /// Park an exhausted mutation in the offline queue when eligible.
    async fn hand_off(&self, request: ApiRequest, err: NetError) -> Result<ApiResponse> {
        let Some(queue) = &self.queue else {
            return Err(err);
        };
        if !self.policy.is_queueable(request.method, &request.endpoint) {
            return Err(err);
        }

        let priority = self.policy.queue_priority(&request.endpoint);
        let options = RequestOptions::from(&request);
        match queue
            .enqueue(&request.endpoint, options, priority, queue.max_retries())
            .await
        {
            Some(request_id) => Err(NetError::Queued { request_id }),
            // Refused by capacity; the caller sees the original failure.
            None => Err(err),
        }
    }

    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::get(endpoint), None).await
    }

    pub async fn post(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::post(endpoint, body), None).await
    }

    pub async fn put(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::new(HttpMethod::Put, endpoint).with_body(body), None)
            .await
    }

    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::new(HttpMethod::Patch, endpoint).with_body(body), None)
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::new(HttpMethod::Delete, endpoint), None)
            .await
    }
}

#[async_trait]
impl RequestSender for RequestDispatcher {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.execute(request, None).await
    }
}
