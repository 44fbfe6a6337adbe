//! Durable, priority-ordered queue of mutations that could not be delivered.
//!
//! Replay is best effort: items are dropped after `max_retries` failed
//! replays or once older than the configured maximum age. Drops are visible
//! only through [`QueueStats`] and [`NetworkEvent::RequestDropped`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chat_core::storage::{load_json, save_json};
use chat_core::{Connectivity, KeyValueStore, QueueConfig, StorageError, Topic};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::NetworkEvent;
use crate::models::{ApiRequest, HttpMethod, RequestPriority};
use crate::transport::RequestSender;

type StoreResult<T> = std::result::Result<T, StorageError>;

/// Method, headers and body of a request handed to [`OfflineQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

impl From<&ApiRequest> for RequestOptions {
    fn from(request: &ApiRequest) -> Self {
        Self {
            method: request.method,
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub priority: RequestPriority,
}

impl QueuedRequest {
    pub fn to_api_request(&self) -> ApiRequest {
        ApiRequest {
            endpoint: self.endpoint.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, max_age: ChronoDuration) -> bool {
        now - self.enqueued_at > max_age
    }

    fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueStats {
    /// Requests ever accepted into the queue.
    pub total_requests: u64,
    pub pending_requests: usize,
    /// Failed replay attempts.
    pub failed_requests: u64,
    pub processed_requests: u64,
    /// Requests evicted, expired or abandoned after exhausting retries.
    pub dropped_requests: u64,
    pub last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Nothing ran: offline, already running, or the store was unreadable.
    Skipped,
    Batch,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub mode: ReplayMode,
    pub processed: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl ReplaySummary {
    fn skipped() -> Self {
        Self {
            mode: ReplayMode::Skipped,
            processed: 0,
            failed: 0,
            dropped: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplayResponse {
    results: ReplayResults,
}

#[derive(Debug, Default, Deserialize)]
struct ReplayResults {
    #[serde(default)]
    processed: Vec<Value>,
    #[serde(default)]
    failed: Vec<Value>,
}

/// Server result entries are either bare ids or objects carrying `id`.
fn entry_id(entry: &Value) -> Option<String> {
    match entry {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Resets the in-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Insert keeping priority descending, then enqueue time ascending.
fn insert_sorted(items: &mut Vec<QueuedRequest>, item: QueuedRequest) {
    let pos = items.partition_point(|existing| {
        existing.priority > item.priority
            || (existing.priority == item.priority && existing.enqueued_at <= item.enqueued_at)
    });
    items.insert(pos, item);
}

/// Evict until there is room for an item of `incoming` priority. Only items
/// of the lowest priority present are evicted, oldest first, and never when
/// that priority is high or above `incoming`.
fn make_room(
    items: &mut Vec<QueuedRequest>,
    capacity: usize,
    incoming: RequestPriority,
) -> Option<Vec<QueuedRequest>> {
    let mut evicted = Vec::new();
    while items.len() >= capacity {
        let Some(lowest) = items.iter().map(|item| item.priority).min() else {
            break;
        };
        if lowest == RequestPriority::High || lowest > incoming {
            items.extend(evicted);
            items.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            });
            return None;
        }
        if let Some(idx) = items.iter().position(|item| item.priority == lowest) {
            evicted.push(items.remove(idx));
        }
    }
    Some(evicted)
}

pub struct OfflineQueue {
    sender: Arc<dyn RequestSender>,
    store: Arc<dyn KeyValueStore>,
    connectivity: Arc<dyn Connectivity>,
    config: QueueConfig,
    replay_endpoint: String,
    events: Topic<NetworkEvent>,
    processing: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
}

impl OfflineQueue {
    pub fn new(
        sender: Arc<dyn RequestSender>,
        store: Arc<dyn KeyValueStore>,
        connectivity: Arc<dyn Connectivity>,
        config: QueueConfig,
        replay_endpoint: impl Into<String>,
        events: Topic<NetworkEvent>,
    ) -> Self {
        Self {
            sender,
            store,
            connectivity,
            config,
            replay_endpoint: replay_endpoint.into(),
            events,
            processing: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    /// Replay attempts a newly parked request gets.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn max_age(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.max_age_secs.min(u64::from(u32::MAX)) as i64)
    }

    /// Reload, mutate and persist the queue and its stats as one unit.
    async fn mutate<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Vec<QueuedRequest>, &mut QueueStats) -> R + Send,
        R: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut items: Vec<QueuedRequest> =
            load_json(self.store.as_ref(), &self.config.storage_key).await?;
        let mut stats: QueueStats = load_json(self.store.as_ref(), &self.config.stats_key).await?;

        let out = f(&mut items, &mut stats);

        stats.pending_requests = items.len();
        save_json(self.store.as_ref(), &self.config.storage_key, &items).await?;
        save_json(self.store.as_ref(), &self.config.stats_key, &stats).await?;
        Ok(out)
    }

    fn publish_dropped(&self, dropped: &[QueuedRequest], reason: &str) {
        for item in dropped {
            warn!(
                "Dropping queued {} {} ({}): {}",
                item.method, item.endpoint, item.id, reason
            );
            self.events.publish(NetworkEvent::RequestDropped {
                endpoint: item.endpoint.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Park a request for later replay. Returns the queued id, or `None` when
    /// the queue is full of higher priority work or the store failed.
    pub async fn enqueue(
        &self,
        endpoint: &str,
        options: RequestOptions,
        priority: RequestPriority,
        max_retries: u32,
    ) -> Option<String> {
        let item = QueuedRequest {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            method: options.method,
            headers: options.headers,
            body: options.body,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
            priority,
        };
        let id = item.id.clone();
        let capacity = self.config.capacity.max(1);

        let outcome = self
            .mutate(move |items, stats| {
                let evicted = if items.len() >= capacity {
                    make_room(items, capacity, priority)
                } else {
                    Some(Vec::new())
                };
                if let Some(evicted) = &evicted {
                    stats.dropped_requests += evicted.len() as u64;
                    stats.total_requests += 1;
                    insert_sorted(items, item);
                }
                evicted
            })
            .await;

        match outcome {
            Ok(Some(evicted)) => {
                self.publish_dropped(&evicted, "evicted to make room");
                info!("Queued {} {} for replay as {}", options.method, endpoint, id);
                self.events.publish(NetworkEvent::RequestQueued {
                    id: id.clone(),
                    endpoint: endpoint.to_string(),
                    priority,
                });
                Some(id)
            }
            Ok(None) => {
                warn!(
                    "Offline queue full ({} items); dropping {} {}",
                    capacity, options.method, endpoint
                );
                self.events.publish(NetworkEvent::RequestDropped {
                    endpoint: endpoint.to_string(),
                    reason: "queue full".to_string(),
                });
                None
            }
            Err(err) => {
                error!("Failed to persist queued request for {endpoint}: {err}");
                None
            }
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Replay everything queued. Concurrent calls while a replay is running
    /// return immediately with [`ReplayMode::Skipped`].
    pub async fn process_queue(&self) -> ReplaySummary {
        let Some(_flight) = FlightGuard::acquire(&self.processing) else {
            debug!("Offline queue replay already running");
            return ReplaySummary::skipped();
        };
        if !self.connectivity.is_connected() {
            debug!("Offline; skipping queue replay");
            return ReplaySummary::skipped();
        }

        match self.replay().await {
            Ok(summary) => {
                if summary.mode != ReplayMode::Skipped {
                    info!(
                        "Queue replay ({:?}): {} processed, {} failed, {} dropped",
                        summary.mode, summary.processed, summary.failed, summary.dropped
                    );
                    self.events.publish(NetworkEvent::QueueProcessed {
                        processed: summary.processed,
                        failed: summary.failed,
                        dropped: summary.dropped,
                    });
                }
                summary
            }
            Err(err) => {
                error!("Offline queue replay aborted: {err}");
                ReplaySummary::skipped()
            }
        }
    }

    async fn replay(&self) -> StoreResult<ReplaySummary> {
        let now = Utc::now();
        let max_age = self.max_age();
        let expired = self
            .mutate(move |items, stats| {
                let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(items)
                    .into_iter()
                    .partition(|item| item.is_expired(now, max_age));
                *items = kept;
                stats.dropped_requests += expired.len() as u64;
                expired
            })
            .await?;
        self.publish_dropped(&expired, "expired");

        let snapshot: Vec<QueuedRequest> =
            load_json(self.store.as_ref(), &self.config.storage_key).await?;
        if snapshot.is_empty() {
            return Ok(ReplaySummary {
                mode: if expired.is_empty() {
                    ReplayMode::Skipped
                } else {
                    ReplayMode::Sequential
                },
                processed: 0,
                failed: 0,
                dropped: expired.len(),
            });
        }

        let mut summary = match self.replay_batch(&snapshot).await {
            Some(results) => self.apply_batch_results(results).await?,
            None => self.replay_sequential(snapshot).await?,
        };
        summary.dropped += expired.len();
        Ok(summary)
    }

    /// One call carrying the whole queue. `None` when the call itself failed.
    async fn replay_batch(&self, snapshot: &[QueuedRequest]) -> Option<ReplayResults> {
        let body = match serde_json::to_value(snapshot) {
            Ok(body) => body,
            Err(err) => {
                error!("Failed to encode offline queue for replay: {err}");
                return None;
            }
        };
        let request = ApiRequest::post(self.replay_endpoint.clone(), body);
        match self.sender.send(request).await {
            Ok(response) if response.is_success() => {
                match serde_json::from_value::<ReplayResponse>(response.data) {
                    Ok(parsed) => Some(parsed.results),
                    Err(err) => {
                        warn!("Unreadable batch replay response, falling back: {err}");
                        None
                    }
                }
            }
            Ok(response) => {
                warn!(
                    "Batch replay rejected with status {}, falling back to sequential replay",
                    response.status
                );
                None
            }
            Err(err) => {
                warn!("Batch replay failed ({err}), falling back to sequential replay");
                None
            }
        }
    }

    async fn apply_batch_results(&self, results: ReplayResults) -> StoreResult<ReplaySummary> {
        let processed: HashSet<String> = results.processed.iter().filter_map(entry_id).collect();
        let failed: HashSet<String> = results.failed.iter().filter_map(entry_id).collect();

        let (processed_count, failed_count, dropped) = self
            .mutate(move |items, stats| {
                let before = items.len();
                items.retain(|item| !processed.contains(&item.id));
                let processed_count = before - items.len();

                let mut failed_count = 0usize;
                for item in items.iter_mut().filter(|item| failed.contains(&item.id)) {
                    item.retry_count += 1;
                    failed_count += 1;
                }
                let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(items)
                    .into_iter()
                    .partition(QueuedRequest::retries_exhausted);
                *items = kept;

                stats.processed_requests += processed_count as u64;
                stats.failed_requests += failed_count as u64;
                stats.dropped_requests += dropped.len() as u64;
                stats.last_processed = Some(Utc::now());
                (processed_count, failed_count, dropped)
            })
            .await?;
        self.publish_dropped(&dropped, "retries exhausted");

        Ok(ReplaySummary {
            mode: ReplayMode::Batch,
            processed: processed_count,
            failed: failed_count,
            dropped: dropped.len(),
        })
    }

    async fn replay_sequential(&self, snapshot: Vec<QueuedRequest>) -> StoreResult<ReplaySummary> {
        let mut summary = ReplaySummary {
            mode: ReplayMode::Sequential,
            processed: 0,
            failed: 0,
            dropped: 0,
        };
        let max_age = self.max_age();

        for queued in snapshot {
            if !self.connectivity.is_connected() {
                info!("Connectivity lost; pausing queue replay");
                break;
            }

            let id = queued.id.clone();
            let now = Utc::now();
            let stale = self
                .mutate(|items, stats| {
                    let idx = items.iter().position(|item| item.id == id)?;
                    let item = &items[idx];
                    if item.retries_exhausted() || item.is_expired(now, max_age) {
                        stats.dropped_requests += 1;
                        return Some(Some(items.remove(idx)));
                    }
                    Some(None)
                })
                .await?;
            match stale {
                // Already replayed or removed elsewhere.
                None => continue,
                Some(Some(item)) => {
                    self.publish_dropped(std::slice::from_ref(&item), "retries exhausted or expired");
                    summary.dropped += 1;
                    continue;
                }
                Some(None) => {}
            }

            let delivered = match self.sender.send(queued.to_api_request()).await {
                Ok(response) if response.is_success() => true,
                Ok(response) => {
                    warn!(
                        "Replay of {} {} returned {}",
                        queued.method, queued.endpoint, response.status
                    );
                    false
                }
                Err(err) => {
                    warn!("Replay of {} {} failed: {}", queued.method, queued.endpoint, err);
                    false
                }
            };

            let exhausted = self
                .mutate(|items, stats| {
                    let idx = items.iter().position(|item| item.id == id)?;
                    if delivered {
                        items.remove(idx);
                        stats.processed_requests += 1;
                        stats.last_processed = Some(Utc::now());
                        return None;
                    }
                    stats.failed_requests += 1;
                    items[idx].retry_count += 1;
                    if items[idx].retries_exhausted() {
                        stats.dropped_requests += 1;
                        return Some(items.remove(idx));
                    }
                    None
                })
                .await?;

            if delivered {
                summary.processed += 1;
            } else {
                summary.failed += 1;
            }
            if let Some(item) = exhausted {
                self.publish_dropped(std::slice::from_ref(&item), "retries exhausted");
                summary.dropped += 1;
            }
        }

        Ok(summary)
    }

    pub async fn get_stats(&self) -> QueueStats {
        let stats = load_json::<QueueStats>(self.store.as_ref(), &self.config.stats_key).await;
        let items =
            load_json::<Vec<QueuedRequest>>(self.store.as_ref(), &self.config.storage_key).await;
        match (stats, items) {
            (Ok(mut stats), Ok(items)) => {
                stats.pending_requests = items.len();
                stats
            }
            (Err(err), _) | (_, Err(err)) => {
                error!("Failed to read offline queue stats: {err}");
                QueueStats::default()
            }
        }
    }

    /// Queued items in replay order.
    pub async fn queued_requests(&self) -> Vec<QueuedRequest> {
        load_json(self.store.as_ref(), &self.config.storage_key)
            .await
            .unwrap_or_else(|err| {
                error!("Failed to read offline queue: {err}");
                Vec::new()
            })
    }

    /// Discard every queued item.
    pub async fn clear(&self) {
        if let Err(err) = self.mutate(|items, _| items.clear()).await {
            error!("Failed to clear offline queue: {err}");
        }
    }

    /// Start replaying whenever connectivity comes back (and once now, if online).
    pub fn init(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let queue = Arc::clone(self);
        let mut online = self.connectivity.subscribe();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            if *online.borrow_and_update() {
                queue.process_queue().await;
            }
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            info!("Connectivity restored; replaying offline queue");
                            queue.process_queue().await;
                        }
                    }
                }
            }
            debug!("Offline queue connectivity listener stopped");
        });

        if let Some(previous) = self.lock_listener().replace(Listener { token, task }) {
            previous.token.cancel();
        }
    }

    /// Stop listening for connectivity changes. A replay already running
    /// finishes in the background.
    pub fn cleanup(&self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.token.cancel();
        }
    }

    /// Stop listening and wait for a replay already running to finish.
    pub async fn shutdown(&self) {
        let Some(listener) = self.lock_listener().take() else {
            return;
        };
        listener.token.cancel();
        if let Err(err) = listener.task.await {
            error!("Offline queue listener ended abnormally: {err}");
        }
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The connectivity listener started by [`OfflineQueue::init`].
struct Listener {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use crate::models::ApiResponse;
    use async_trait::async_trait;
    use chat_core::{ConnectivityMonitor, MemoryKeyValueStore};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Handler = Box<dyn Fn(&ApiRequest) -> crate::Result<ApiResponse> + Send + Sync>;

    struct ScriptedSender {
        calls: Mutex<Vec<ApiRequest>>,
        count: AtomicUsize,
        delay: Duration,
        handler: Handler,
    }

    impl ScriptedSender {
        fn new(handler: Handler) -> Arc<Self> {
            Self::with_delay(Duration::ZERO, handler)
        }

        fn with_delay(delay: Duration, handler: Handler) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
                delay,
                handler,
            })
        }

        fn calls(&self) -> Vec<ApiRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestSender for ScriptedSender {
        async fn send(&self, request: ApiRequest) -> crate::Result<ApiResponse> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.handler)(&request)
        }
    }

    /// Replay endpoint acknowledges every item it receives.
    fn ack_everything() -> Handler {
        Box::new(|request| {
            let ids: Vec<Value> = request
                .body
                .as_ref()
                .and_then(Value::as_array)
                .map(|items| items.iter().map(|item| item["id"].clone()).collect())
                .unwrap_or_default();
            Ok(ApiResponse::new(
                200,
                json!({"results": {"processed": ids, "failed": []}}),
            ))
        })
    }

    fn queue_with(
        sender: Arc<dyn RequestSender>,
        store: Arc<MemoryKeyValueStore>,
        connectivity: Arc<ConnectivityMonitor>,
        capacity: usize,
    ) -> OfflineQueue {
        let config = QueueConfig {
            capacity,
            ..QueueConfig::default()
        };
        OfflineQueue::new(
            sender,
            store,
            connectivity,
            config,
            "/offline/replay",
            Topic::new(64),
        )
    }

    fn post(body: Value) -> RequestOptions {
        RequestOptions::new(HttpMethod::Post).with_body(body)
    }

    #[tokio::test]
    async fn test_enqueue_orders_by_priority_then_age() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(false)),
            100,
        );

        queue.enqueue("/a", post(json!(1)), RequestPriority::Low, 3).await;
        queue.enqueue("/b", post(json!(2)), RequestPriority::Normal, 3).await;
        queue.enqueue("/c", post(json!(3)), RequestPriority::High, 3).await;
        queue.enqueue("/d", post(json!(4)), RequestPriority::Normal, 3).await;

        let order: Vec<String> = queue
            .queued_requests()
            .await
            .into_iter()
            .map(|item| item.endpoint)
            .collect();
        assert_eq!(order, vec!["/c", "/b", "/d", "/a"]);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_priority_oldest_first() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(false)),
            100,
        );

        for i in 0..50 {
            queue
                .enqueue(&format!("/normal/{i}"), post(json!(i)), RequestPriority::Normal, 3)
                .await;
        }
        for i in 0..50 {
            queue
                .enqueue(&format!("/low/{i}"), post(json!(i)), RequestPriority::Low, 3)
                .await;
        }
        let id = queue
            .enqueue("/emotion/log", post(json!("x")), RequestPriority::High, 3)
            .await;
        assert!(id.is_some());

        let items = queue.queued_requests().await;
        assert_eq!(items.len(), 100);
        assert_eq!(items[0].endpoint, "/emotion/log");
        assert!(!items.iter().any(|item| item.endpoint == "/low/0"));
        assert!(items.iter().any(|item| item.endpoint == "/low/1"));
        assert_eq!(
            items
                .iter()
                .filter(|item| item.priority == RequestPriority::Normal)
                .count(),
            50
        );

        let stats = queue.get_stats().await;
        assert_eq!(stats.pending_requests, 100);
        assert_eq!(stats.dropped_requests, 1);
        assert_eq!(stats.total_requests, 101);
    }

    #[tokio::test]
    async fn test_full_high_priority_queue_refuses_insertion() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(false)),
            5,
        );
        for i in 0..5 {
            queue
                .enqueue(&format!("/emotion/{i}"), post(json!(i)), RequestPriority::High, 3)
                .await;
        }

        assert!(queue
            .enqueue("/emotion/late", post(json!(9)), RequestPriority::High, 3)
            .await
            .is_none());
        assert!(queue
            .enqueue("/messages", post(json!(9)), RequestPriority::Low, 3)
            .await
            .is_none());

        let items = queue.queued_requests().await;
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].endpoint, "/emotion/0");
    }

    #[tokio::test]
    async fn test_lower_priority_never_evicts_higher() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(false)),
            3,
        );
        for i in 0..3 {
            queue
                .enqueue(&format!("/n/{i}"), post(json!(i)), RequestPriority::Normal, 3)
                .await;
        }
        assert!(queue
            .enqueue("/low", post(json!(0)), RequestPriority::Low, 3)
            .await
            .is_none());
        assert!(queue
            .enqueue("/n/3", post(json!(3)), RequestPriority::Normal, 3)
            .await
            .is_some());
        let endpoints: Vec<String> = queue
            .queued_requests()
            .await
            .into_iter()
            .map(|item| item.endpoint)
            .collect();
        assert_eq!(endpoints, vec!["/n/1", "/n/2", "/n/3"]);
    }

    #[tokio::test]
    async fn test_batch_replay_removes_processed_items() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(true)),
            100,
        );
        for _ in 0..3 {
            queue
                .enqueue("/messages", post(json!({"text": "hi"})), RequestPriority::Normal, 3)
                .await;
        }

        let summary = queue.process_queue().await;
        assert_eq!(summary.mode, ReplayMode::Batch);
        assert_eq!(summary.processed, 3);

        let calls = sender.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].endpoint, "/offline/replay");
        assert_eq!(calls[0].body.as_ref().and_then(Value::as_array).map(Vec::len), Some(3));

        let stats = queue.get_stats().await;
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.processed_requests, 3);
        assert!(stats.last_processed.is_some());
    }

    #[tokio::test]
    async fn test_batch_replay_counts_failed_items() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let failing_id = Arc::new(Mutex::new(String::new()));
        let failing = Arc::clone(&failing_id);
        let sender = ScriptedSender::new(Box::new(move |request| {
            let target = failing.lock().unwrap().clone();
            let items = request.body.as_ref().and_then(Value::as_array).cloned().unwrap_or_default();
            let processed: Vec<Value> = items
                .iter()
                .filter(|item| item["id"] != json!(target))
                .map(|item| json!({"id": item["id"].clone()}))
                .collect();
            Ok(ApiResponse::new(
                200,
                json!({"results": {"processed": processed, "failed": [target]}}),
            ))
        }));
        let queue = queue_with(sender, store, Arc::new(ConnectivityMonitor::new(true)), 100);

        let keep = queue
            .enqueue("/profile", post(json!({})), RequestPriority::Normal, 1)
            .await
            .unwrap();
        queue
            .enqueue("/messages", post(json!({})), RequestPriority::Normal, 3)
            .await;
        *failing_id.lock().unwrap() = keep;

        let summary = queue.process_queue().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        // max_retries = 1, so one failed replay exhausts it.
        assert_eq!(summary.dropped, 1);

        let stats = queue.get_stats().await;
        assert_eq!(stats.pending_requests, 0);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.dropped_requests, 1);
    }

    #[tokio::test]
    async fn test_sequential_fallback_when_batch_call_fails() {
        let sender = ScriptedSender::new(Box::new(|request| {
            if request.endpoint == "/offline/replay" {
                return Err(NetError::Server {
                    status: 503,
                    message: "down".into(),
                });
            }
            if request.endpoint == "/broken" {
                return Ok(ApiResponse::new(500, Value::Null));
            }
            Ok(ApiResponse::new(201, json!({"ok": true})))
        }));
        let queue = queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(true)),
            100,
        );
        queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;
        queue.enqueue("/broken", post(json!(2)), RequestPriority::Normal, 2).await;

        let summary = queue.process_queue().await;
        assert_eq!(summary.mode, ReplayMode::Sequential);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(sender.calls().len(), 3);

        let remaining = queue.queued_requests().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint, "/broken");
        assert_eq!(remaining[0].retry_count, 1);

        // Second failure reaches max_retries = 2 and the item is dropped.
        let summary = queue.process_queue().await;
        assert_eq!(summary.dropped, 1);
        assert!(queue.queued_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_items_are_dropped_without_replay() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let stale = QueuedRequest {
            id: "stale".to_string(),
            endpoint: "/messages".to_string(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            body: None,
            enqueued_at: Utc::now() - ChronoDuration::days(8),
            retry_count: 0,
            max_retries: 3,
            priority: RequestPriority::Normal,
        };
        save_json(store.as_ref(), &QueueConfig::default().storage_key, &vec![stale])
            .await
            .unwrap();

        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(sender.clone(), store, Arc::new(ConnectivityMonitor::new(true)), 100);

        let summary = queue.process_queue().await;
        assert_eq!(summary.dropped, 1);
        assert!(sender.calls().is_empty());
        assert_eq!(queue.get_stats().await.dropped_requests, 1);
    }

    #[tokio::test]
    async fn test_process_queue_is_single_flight() {
        let sender = ScriptedSender::with_delay(Duration::from_millis(50), ack_everything());
        let queue = queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(true)),
            100,
        );
        queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;

        let (first, second) = tokio::join!(queue.process_queue(), queue.process_queue());
        assert_eq!(first.mode, ReplayMode::Batch);
        assert_eq!(second.mode, ReplayMode::Skipped);
        assert_eq!(sender.count.load(Ordering::SeqCst), 1);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_offline_replay_is_skipped() {
        let sender = ScriptedSender::new(ack_everything());
        let queue = queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(ConnectivityMonitor::new(false)),
            100,
        );
        queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;

        let summary = queue.process_queue().await;
        assert_eq!(summary.mode, ReplayMode::Skipped);
        assert!(sender.calls().is_empty());
        assert_eq!(queue.get_stats().await.pending_requests, 1);
    }

    #[tokio::test]
    async fn test_init_replays_when_connectivity_returns() {
        let sender = ScriptedSender::new(ack_everything());
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let queue = Arc::new(queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            connectivity.clone(),
            100,
        ));
        queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;
        queue.init();

        connectivity.set_connected(true);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while queue.get_stats().await.pending_requests > 0 {
            assert!(tokio::time::Instant::now() < deadline, "queue was not replayed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sender.calls().len(), 1);
        queue.cleanup();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_startup_replay() {
        let sender = ScriptedSender::new(ack_everything());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let queue = Arc::new(queue_with(
            sender.clone(),
            Arc::new(MemoryKeyValueStore::new()),
            connectivity,
            100,
        ));
        queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;

        queue.init();
        queue.shutdown().await;

        assert_eq!(queue.get_stats().await.pending_requests, 0);
        assert_eq!(sender.calls().len(), 1);
        assert!(!queue.is_processing());
        // A second shutdown has nothing left to stop.
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        {
            let queue = queue_with(
                ScriptedSender::new(ack_everything()),
                store.clone(),
                connectivity.clone(),
                100,
            );
            queue.enqueue("/messages", post(json!(1)), RequestPriority::Normal, 3).await;
        }
        let queue = queue_with(ScriptedSender::new(ack_everything()), store, connectivity, 100);
        let items = queue.queued_requests().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].body, Some(json!(1)));
    }
}
