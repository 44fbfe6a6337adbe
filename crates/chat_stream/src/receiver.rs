use std::sync::Arc;
use std::time::Duration;

use chat_client::{
    ApiRequest, ApiResponse, HttpTransport, NetError, RequestDispatcher, RequestSender, Result,
    RetryPolicy,
};
use chat_core::{StreamConfig, ThrottleConfig};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tool_tracker::ToolExecutionTracker;

use crate::session::{StreamItem, StreamSession};
use crate::throttle::UiThrottle;

/// Body of the streaming chat call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatStreamRequest<'a> {
    pub message: &'a str,
    pub stream: bool,
    pub temperature: f32,
    pub n_predict: u32,
    pub stop: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub content: String,
    pub metadata: Option<Value>,
    pub fragments: usize,
    /// The reply came from the non-streaming endpoint.
    pub used_fallback: bool,
}

/// Reply text of the non-streaming endpoint.
fn legacy_text(data: &Value) -> String {
    ["response", "content", "message"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| match data {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
}

/// Streams chat replies, surfacing partial content through a callback.
pub struct ChatStreamClient {
    transport: Arc<HttpTransport>,
    dispatcher: Arc<RequestDispatcher>,
    stream: StreamConfig,
    throttle: ThrottleConfig,
    stream_endpoint: String,
    legacy_endpoint: String,
    tracker: Option<ToolExecutionTracker>,
}

impl ChatStreamClient {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        let config = transport.config();
        let stream = config.stream.clone();
        let throttle = config.throttle.clone();
        let stream_endpoint = config.endpoints.chat_stream.clone();
        let legacy_endpoint = config.endpoints.chat_legacy.clone();
        let sender: Arc<dyn RequestSender> = transport.clone();
        let dispatcher = Arc::new(RequestDispatcher::new(
            sender,
            transport.policy().clone(),
            RetryPolicy::from(&config.retry),
        ));
        Self {
            transport,
            dispatcher,
            stream,
            throttle,
            stream_endpoint,
            legacy_endpoint,
            tracker: None,
        }
    }

    /// Classify responses through `dispatcher`, so a 401 reaches its
    /// session observer and event topic.
    pub fn with_dispatcher(mut self, dispatcher: Arc<RequestDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Feed every fragment to `tracker` as it arrives.
    pub fn with_tracker(mut self, tracker: ToolExecutionTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub async fn send_message<F>(&self, message: &str, on_update: F) -> Result<StreamOutcome>
    where
        F: FnMut(&str) + Send,
    {
        self.send_message_with_cancel(message, on_update, &CancellationToken::new())
            .await
    }

    /// Stream a reply. `on_update` receives the running reply text; the
    /// resolved content is always the complete reply.
    pub async fn send_message_with_cancel<F>(
        &self,
        message: &str,
        mut on_update: F,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let mut received_any = false;
        let primary = self
            .stream_reply(message, &mut on_update, cancel, &mut received_any)
            .await;

        match primary {
            Ok(outcome) => Ok(outcome),
            Err(err @ (NetError::Cancelled | NetError::AuthExpired { .. })) => Err(err),
            Err(err) if self.stream.legacy_fallback && !received_any => {
                warn!("Chat stream failed ({err}); falling back to {}", self.legacy_endpoint);
                self.legacy_reply(message, &mut on_update, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn stream_reply<F>(
        &self,
        message: &str,
        on_update: &mut F,
        cancel: &CancellationToken,
        received_any: &mut bool,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let body = serde_json::to_value(ChatStreamRequest {
            message,
            stream: true,
            temperature: self.stream.temperature,
            n_predict: self.stream.n_predict,
            stop: &self.stream.stop,
        })
        .map_err(|e| NetError::Parse(e.to_string()))?;
        let request = ApiRequest::post(self.stream_endpoint.clone(), body)
            .with_header("Accept", "text/event-stream");

        let budget = Duration::from_millis(self.stream.hard_timeout_ms);
        let work = async {
            let response = self.transport.open(&request).await?;
            let status = response.status().as_u16();
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                let failed = ApiResponse::from_body(status, &text);
                return Err(self.rejection(&self.stream_endpoint, failed));
            }

            let mut session = StreamSession::new();
            let mut throttle = UiThrottle::new(self.throttle.clone());
            let mut surfaced_chars = 0usize;
            let mut body = response.bytes_stream();

            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| NetError::Network(e.to_string()))?;
                let items = session.ingest(&chunk);
                self.deliver(items, &session, &mut throttle, on_update, &mut surfaced_chars, received_any)
                    .await;
                if session.is_complete() {
                    break;
                }
            }
            if !session.is_complete() {
                debug!("Chat stream ended without a terminal sentinel");
                let items = session.finish();
                self.deliver(items, &session, &mut throttle, on_update, &mut surfaced_chars, received_any)
                    .await;
            }

            // The last visible update always shows the whole reply.
            if surfaced_chars != session.content_chars() {
                on_update(session.content());
            }
            info!(
                "Chat stream finished: {} fragment(s), {} chars",
                session.fragment_count(),
                session.content_chars()
            );
            Ok(StreamOutcome {
                metadata: session.metadata().cloned(),
                fragments: session.fragment_count(),
                content: session.into_content(),
                used_fallback: false,
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(NetError::Cancelled),
            outcome = tokio::time::timeout(budget, work) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!("Chat stream exceeded {}ms", self.stream.hard_timeout_ms);
                    Err(NetError::Timeout { after_ms: self.stream.hard_timeout_ms })
                }
            },
        }
    }

    async fn deliver<F>(
        &self,
        items: Vec<StreamItem>,
        session: &StreamSession,
        throttle: &mut UiThrottle,
        on_update: &mut F,
        surfaced_chars: &mut usize,
        received_any: &mut bool,
    ) where
        F: FnMut(&str) + Send,
    {
        // `session` already holds every fragment in `items`; rebuild the
        // running text fragment by fragment for the throttle decisions.
        let pending: usize = items
            .iter()
            .map(|item| match item {
                StreamItem::Fragment(text) => text.len(),
                _ => 0,
            })
            .sum();
        let content = session.content();
        let mut end = content.len() - pending;

        for item in items {
            match item {
                StreamItem::Fragment(text) => {
                    *received_any = true;
                    end += text.len();
                    let running = &content[..end];
                    if let Some(tracker) = &self.tracker {
                        tracker.observe(&text).await;
                    }
                    let running_chars = running.chars().count();
                    if throttle.should_surface(running_chars, &text) {
                        on_update(running);
                        *surfaced_chars = running_chars;
                    }
                }
                StreamItem::Metadata(context) => debug!("Stream metadata: {context}"),
                StreamItem::Done => debug!("Chat stream reached its terminal sentinel"),
            }
        }
    }

    /// The typed error for a non-2xx response, with the 401 logout policy
    /// applied.
    fn rejection(&self, endpoint: &str, response: ApiResponse) -> NetError {
        let status = response.status;
        match self.dispatcher.classify(endpoint, response) {
            Err(err) => err,
            Ok(_) => NetError::Network(format!("Unexpected status {status} from {endpoint}")),
        }
    }

    async fn legacy_reply<F>(
        &self,
        message: &str,
        on_update: &mut F,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let request = ApiRequest::post(self.legacy_endpoint.clone(), json!({ "message": message }));
        let response = self.transport.send_once(&request, cancel).await?;
        let response = self.dispatcher.classify(&self.legacy_endpoint, response)?;

        let content = legacy_text(&response.data);
        if let Some(tracker) = &self.tracker {
            tracker.observe(&content).await;
        }
        on_update(&content);
        Ok(StreamOutcome {
            metadata: response.data.get("personalityContext").cloned(),
            fragments: usize::from(!content.is_empty()),
            content,
            used_fallback: true,
        })
    }
}
