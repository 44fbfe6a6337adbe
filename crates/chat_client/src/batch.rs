//! Debounced coalescing of independent requests into batch calls.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chat_core::storage::{load_json, save_json};
use chat_core::{BatchConfig, KeyValueStore};
use futures::future::join_all;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::NetError;
use crate::models::{ApiRequest, HttpMethod};
use crate::transport::RequestSender;

/// One logical sub-request carried inside a batch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl BatchRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub endpoint: String,
    pub method: HttpMethod,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub results: Vec<BatchItemResult>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// A physical batch call. Immutable once built.
#[derive(Debug, Clone)]
pub struct BatchEnvelope {
    batch_id: String,
    requests: Vec<BatchRequest>,
}

impl BatchEnvelope {
    fn new(requests: Vec<BatchRequest>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            requests,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn requests(&self) -> &[BatchRequest] {
        &self.requests
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BatchError {
    #[error("Batch call failed: {0}")]
    Transport(NetError),

    #[error("Batch call rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed batch response: {0}")]
    Malformed(String),

    #[error("Batch response has no result for position {index}")]
    MissingResult { index: usize },

    #[error("Batch coalescer dropped the request")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchStats {
    pub total_batches: u64,
    pub total_requests: u64,
    pub failed_batches: u64,
    pub average_batch_size: f64,
}

type Reply = oneshot::Sender<Result<Vec<BatchItemResult>, BatchError>>;

struct PendingBatch {
    requests: Vec<BatchRequest>,
    created_at: Instant,
    reply: Reply,
}

#[derive(Default)]
struct State {
    pending: Vec<PendingBatch>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// Per-caller bookkeeping while a flush is in flight.
struct Waiter {
    reply: Reply,
    results: Vec<Option<BatchItemResult>>,
    error: Option<BatchError>,
}

struct Inner {
    sender: Arc<dyn RequestSender>,
    store: Arc<dyn KeyValueStore>,
    config: BatchConfig,
    endpoint: String,
    state: Mutex<State>,
    stats_lock: tokio::sync::Mutex<()>,
}

/// Merges requests arriving close together into batch calls.
///
/// A flush happens immediately once `max_batch_size` sub-requests are waiting
/// or the oldest waiter has been pending for `max_wait_ms`; otherwise a single
/// debounce timer of `batch_delay_ms` is re-armed on every arrival.
#[derive(Clone)]
pub struct BatchCoalescer {
    inner: Arc<Inner>,
}

impl BatchCoalescer {
    pub fn new(
        sender: Arc<dyn RequestSender>,
        store: Arc<dyn KeyValueStore>,
        config: BatchConfig,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender,
                store,
                config,
                endpoint: endpoint.into(),
                state: Mutex::new(State::default()),
                stats_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub async fn add_to_batch(&self, request: BatchRequest) -> Result<BatchItemResult, BatchError> {
        let mut results = self.add_multiple_to_batch(vec![request]).await?;
        results.pop().ok_or(BatchError::MissingResult { index: 0 })
    }

    /// Results come back in the order of `requests`, however they were chunked.
    pub async fn add_multiple_to_batch(
        &self,
        requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchItemResult>, BatchError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let (reply, rx) = oneshot::channel();
        self.inner.submit(PendingBatch {
            requests,
            created_at: Instant::now(),
            reply,
        });
        rx.await.unwrap_or(Err(BatchError::Closed))
    }

    /// Dispatch everything pending right now and wait for it to complete.
    pub async fn flush_now(&self) {
        let drained = self.inner.drain();
        if !drained.is_empty() {
            Arc::clone(&self.inner).dispatch(drained).await;
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.inner
            .lock_state()
            .pending
            .iter()
            .map(|batch| batch.requests.len())
            .sum()
    }

    pub async fn stats(&self) -> BatchStats {
        load_json(self.inner.store.as_ref(), &self.inner.config.stats_key)
            .await
            .unwrap_or_else(|err| {
                error!("Failed to read batch stats: {err}");
                BatchStats::default()
            })
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    fn submit(self: &Arc<Self>, batch: PendingBatch) {
        let mut state = self.lock_state();
        state.pending.push(batch);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let queued: usize = state.pending.iter().map(|b| b.requests.len()).sum();
        let oldest_wait = state
            .pending
            .first()
            .map(|b| b.created_at.elapsed())
            .unwrap_or_default();

        if queued >= self.max_batch_size()
            || oldest_wait >= Duration::from_millis(self.config.max_wait_ms)
        {
            debug!("Flushing {queued} batched request(s) immediately");
            let drained = std::mem::take(&mut state.pending);
            drop(state);
            tokio::spawn(Arc::clone(self).dispatch(drained));
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let inner = Arc::clone(self);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.on_timer(generation);
        }));
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let drained = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            std::mem::take(&mut state.pending)
        };
        if !drained.is_empty() {
            // Dispatch outside the timer task so a later abort cannot cut it short.
            tokio::spawn(Arc::clone(self).dispatch(drained));
        }
    }

    fn drain(&self) -> Vec<PendingBatch> {
        let mut state = self.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;
        std::mem::take(&mut state.pending)
    }

    async fn dispatch(self: Arc<Self>, batches: Vec<PendingBatch>) {
        let mut waiters = Vec::with_capacity(batches.len());
        // (waiter index, slot within that waiter, request)
        let mut flat = Vec::new();
        for (waiter_idx, batch) in batches.into_iter().enumerate() {
            let len = batch.requests.len();
            for (slot, request) in batch.requests.into_iter().enumerate() {
                flat.push((waiter_idx, slot, request));
            }
            waiters.push(Waiter {
                reply: batch.reply,
                results: vec![None; len],
                error: None,
            });
        }

        let chunks: Vec<_> = flat.chunks(self.max_batch_size()).collect();
        let outcomes = join_all(chunks.iter().map(|chunk| {
            let requests = chunk.iter().map(|(_, _, request)| request.clone()).collect();
            self.send_chunk(BatchEnvelope::new(requests))
        }))
        .await;

        let mut failed_chunks = 0u64;
        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    let mut results = results.into_iter().map(Some).collect::<Vec<_>>();
                    for (pos, (waiter_idx, slot, _)) in chunk.iter().enumerate() {
                        let waiter = &mut waiters[*waiter_idx];
                        match results.get_mut(pos).and_then(Option::take) {
                            Some(result) => waiter.results[*slot] = Some(result),
                            None => {
                                waiter
                                    .error
                                    .get_or_insert(BatchError::MissingResult { index: pos });
                            }
                        }
                    }
                }
                Err(err) => {
                    failed_chunks += 1;
                    for (waiter_idx, _, _) in chunk.iter() {
                        waiters[*waiter_idx].error.get_or_insert_with(|| err.clone());
                    }
                }
            }
        }

        let total = flat.len() as u64;
        let chunk_count = chunks.len() as u64;
        self.record(chunk_count, total, failed_chunks).await;

        for waiter in waiters {
            let outcome = match waiter.error {
                Some(err) => Err(err),
                None => Ok(waiter.results.into_iter().flatten().collect()),
            };
            // The caller may have given up waiting.
            let _ = waiter.reply.send(outcome);
        }
    }

    async fn send_chunk(&self, envelope: BatchEnvelope) -> Result<Vec<BatchItemResult>, BatchError> {
        let body = serde_json::to_value(envelope.requests())
            .map_err(|e| BatchError::Malformed(e.to_string()))?;
        debug!(
            "Sending batch {} with {} request(s)",
            envelope.batch_id(),
            envelope.requests().len()
        );

        let response = self
            .sender
            .send(ApiRequest::post(self.endpoint.clone(), body))
            .await
            .map_err(|err| {
                warn!("Batch {} failed: {}", envelope.batch_id(), err);
                BatchError::Transport(err)
            })?;
        if !response.is_success() {
            warn!("Batch {} rejected with status {}", envelope.batch_id(), response.status);
            return Err(BatchError::Rejected {
                status: response.status,
                message: response.error_message(),
            });
        }

        let parsed: BatchResponse = serde_json::from_value(response.data)
            .map_err(|e| BatchError::Malformed(e.to_string()))?;
        if parsed.results.len() != envelope.requests().len() {
            warn!(
                "Batch {} returned {} result(s) for {} request(s)",
                envelope.batch_id(),
                parsed.results.len(),
                envelope.requests().len()
            );
        }
        Ok(parsed.results)
    }

    async fn record(&self, batches: u64, requests: u64, failed: u64) {
        let _guard = self.stats_lock.lock().await;
        let key = &self.config.stats_key;
        let outcome = async {
            let mut stats: BatchStats = load_json(self.store.as_ref(), key).await?;
            stats.total_batches += batches;
            stats.total_requests += requests;
            stats.failed_batches += failed;
            if stats.total_batches > 0 {
                stats.average_batch_size = stats.total_requests as f64 / stats.total_batches as f64;
            }
            save_json(self.store.as_ref(), key, &stats).await
        };
        if let Err(err) = outcome.await {
            error!("Failed to persist batch stats: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApiResponse;
    use async_trait::async_trait;
    use chat_core::MemoryKeyValueStore;
    use serde_json::json;

    /// Batch endpoint that echoes each sub-request's endpoint back as data.
    #[derive(Default)]
    struct EchoBatch {
        calls: Mutex<Vec<(Instant, Vec<BatchRequest>)>>,
    }

    impl EchoBatch {
        fn sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(|(_, r)| r.len()).collect()
        }
    }

    #[async_trait]
    impl RequestSender for EchoBatch {
        async fn send(&self, request: ApiRequest) -> crate::Result<ApiResponse> {
            let requests: Vec<BatchRequest> =
                serde_json::from_value(request.body.unwrap_or(Value::Null)).unwrap();
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), requests.clone()));
            if requests.iter().any(|r| r.endpoint == "/fail") {
                return Err(NetError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                });
            }
            let results: Vec<Value> = requests
                .iter()
                .map(|r| {
                    json!({
                        "endpoint": r.endpoint,
                        "method": r.method,
                        "success": true,
                        "data": {"echo": r.endpoint},
                        "timestamp": 1
                    })
                })
                .collect();
            Ok(ApiResponse::new(
                200,
                json!({"batchId": "b1", "results": results, "timestamp": 1}),
            ))
        }
    }

    fn coalescer(sender: Arc<EchoBatch>) -> BatchCoalescer {
        BatchCoalescer::new(
            sender,
            Arc::new(MemoryKeyValueStore::new()),
            BatchConfig::default(),
            "/batch",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_at_max_size_then_after_debounce() {
        let sender = Arc::new(EchoBatch::default());
        let coalescer = coalescer(sender.clone());

        let mut handles = Vec::new();
        for i in 0..12 {
            let c = coalescer.clone();
            handles.push(tokio::spawn(async move {
                c.add_to_batch(BatchRequest::get(format!("/items/{i}"))).await
            }));
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        let last_arrival = Instant::now();

        assert_eq!(sender.sizes(), vec![10]);
        assert_eq!(coalescer.pending_requests(), 2);

        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.data, Some(json!({"echo": format!("/items/{i}")})));
        }
        assert_eq!(sender.sizes(), vec![10, 2]);

        let second_call = sender.calls.lock().unwrap()[1].0;
        let waited = second_call - last_arrival;
        assert!(waited >= Duration::from_millis(90) && waited <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_forces_flush_under_steady_arrivals() {
        let sender = Arc::new(EchoBatch::default());
        let coalescer = coalescer(sender.clone());
        let start = Instant::now();

        let mut handles = Vec::new();
        for i in 0..7 {
            let c = coalescer.clone();
            handles.push(tokio::spawn(async move {
                c.add_to_batch(BatchRequest::get(format!("/items/{i}"))).await
            }));
            tokio::time::sleep(Duration::from_millis(90)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let calls = sender.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 7);
        let flushed_after = calls[0].0 - start;
        assert!(flushed_after >= Duration::from_millis(540) && flushed_after < Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_results_map_back_by_index_across_chunks() {
        let sender = Arc::new(EchoBatch::default());
        let coalescer = coalescer(sender.clone());

        let requests: Vec<BatchRequest> = (0..13)
            .map(|i| BatchRequest::get(format!("/items/{i}")))
            .collect();
        let results = coalescer.add_multiple_to_batch(requests).await.unwrap();

        assert_eq!(sender.sizes(), vec![10, 3]);
        assert_eq!(results.len(), 13);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.endpoint, format!("/items/{i}"));
        }

        let stats = coalescer.stats().await;
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.total_requests, 13);
        assert_eq!(stats.failed_batches, 0);
        assert!((stats.average_batch_size - 6.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_rejects_only_its_waiters() {
        let sender = Arc::new(EchoBatch::default());
        let coalescer = coalescer(sender.clone());

        let ok = {
            let c = coalescer.clone();
            let requests = (0..10).map(|i| BatchRequest::get(format!("/items/{i}"))).collect();
            tokio::spawn(async move { c.add_multiple_to_batch(requests).await })
        };
        tokio::task::yield_now().await;
        let failing = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.add_to_batch(BatchRequest::get("/fail")).await })
        };
        tokio::task::yield_now().await;
        let neighbour = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.add_to_batch(BatchRequest::get("/items/x")).await })
        };

        assert_eq!(ok.await.unwrap().unwrap().len(), 10);
        assert!(matches!(
            failing.await.unwrap(),
            Err(BatchError::Transport(NetError::Server { status: 502, .. }))
        ));
        // Shares the failed chunk, so it is rejected too.
        assert!(neighbour.await.unwrap().is_err());
        assert_eq!(coalescer.stats().await.failed_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_dispatches_pending_work() {
        let sender = Arc::new(EchoBatch::default());
        let coalescer = coalescer(sender.clone());
        let c = coalescer.clone();
        let handle = tokio::spawn(async move { c.add_to_batch(BatchRequest::get("/a")).await });
        tokio::task::yield_now().await;

        coalescer.flush_now().await;
        assert_eq!(sender.sizes(), vec![1]);
        assert!(handle.await.unwrap().unwrap().success);
    }
}
