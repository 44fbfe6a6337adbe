use std::sync::Arc;

use async_trait::async_trait;
use chat_client::{
    BatchCoalescer, EndpointPolicy, HttpTransport, NetworkEvent, OfflineQueue, RequestDispatcher,
    RequestSender, Result, RetryPolicy,
};
use chat_core::paths::store_dir;
use chat_core::{
    ConnectivityMonitor, FileKeyValueStore, KeyValueStore, LoggingSessionObserver, NetConfig,
    StaticTokenProvider, Topic,
};
use chat_stream::ChatStreamClient;
use log::info;
use tool_tracker::{MarkerTable, ResultAggregator, ToolExecution, ToolExecutionTracker};

/// Environment variable holding the bearer token for the CLI.
pub const TOKEN_ENV: &str = "CHAT_NET_TOKEN";

/// Logs completed hand-off tool runs.
struct LoggingAggregator;

#[async_trait]
impl ResultAggregator for LoggingAggregator {
    async fn on_tool_completed(&self, execution: ToolExecution) {
        info!(
            "Tool {} finished ({}); results ready for aggregation",
            execution.tool_name, execution.id
        );
    }
}

/// Every component of the network layer, built once and shared.
pub struct NetworkServices {
    config: Arc<NetConfig>,
    tokens: Arc<StaticTokenProvider>,
    connectivity: Arc<ConnectivityMonitor>,
    session: Arc<LoggingSessionObserver>,
    transport: Arc<HttpTransport>,
    dispatcher: Arc<RequestDispatcher>,
    queue: Arc<OfflineQueue>,
    batch: BatchCoalescer,
    tracker: ToolExecutionTracker,
    stream: ChatStreamClient,
    events: Topic<NetworkEvent>,
}

impl NetworkServices {
    pub fn new(
        config: NetConfig,
        store: Arc<dyn KeyValueStore>,
        token: Option<String>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tokens = Arc::new(StaticTokenProvider::new(token));
        let connectivity = Arc::new(ConnectivityMonitor::new(!config.start_offline));
        let session = Arc::new(LoggingSessionObserver::new());
        let events = Topic::new(256);

        let transport = Arc::new(HttpTransport::new(Arc::clone(&config), tokens.clone())?);
        let sender: Arc<dyn RequestSender> = transport.clone();

        let queue = Arc::new(OfflineQueue::new(
            Arc::clone(&sender),
            Arc::clone(&store),
            connectivity.clone(),
            config.queue.clone(),
            config.endpoints.offline_replay.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(
            RequestDispatcher::new(
                Arc::clone(&sender),
                EndpointPolicy::new(config.endpoints.clone()),
                RetryPolicy::from(&config.retry),
            )
            .with_session_observer(session.clone())
            .with_offline_queue(Arc::clone(&queue))
            .with_events(events.clone()),
        );
        // Batch and replay calls go out once through the bare transport: a
        // failed background call is reported to its waiters or counted as a
        // failed replay, never parked or turned into a logout.
        let batch = BatchCoalescer::new(
            sender,
            store,
            config.batch.clone(),
            config.endpoints.batch.clone(),
        );
        let tracker = ToolExecutionTracker::with_aggregator(
            MarkerTable::default(),
            &config.tracker,
            Arc::new(LoggingAggregator),
        );
        let stream = ChatStreamClient::new(Arc::clone(&transport))
            .with_dispatcher(Arc::clone(&dispatcher))
            .with_tracker(tracker.clone());

        Ok(Self {
            config,
            tokens,
            connectivity,
            session,
            transport,
            dispatcher,
            queue,
            batch,
            tracker,
            stream,
            events,
        })
    }

    /// Build from `NetConfig::load()`, a file store under `~/.chatnet/store`
    /// and the token in `CHAT_NET_TOKEN`.
    pub fn from_env() -> Result<Self> {
        Self::from_config(NetConfig::load())
    }

    /// Like [`NetworkServices::from_env`] with an already prepared config.
    pub fn from_config(config: NetConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(store_dir()));
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty());
        Self::new(config, store, token)
    }

    /// Start connectivity-driven replay of the offline queue.
    pub fn init(&self) {
        info!("Initialising network services against {}", self.config.api_base);
        self.queue.init();
    }

    /// Stop background listeners, let a running replay finish and flush
    /// batches still waiting for their timer.
    pub async fn cleanup(&self) {
        self.queue.shutdown().await;
        self.batch.flush_now().await;
        info!("Network services stopped");
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<StaticTokenProvider> {
        &self.tokens
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn session(&self) -> &Arc<LoggingSessionObserver> {
        &self.session
    }

    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn batch(&self) -> &BatchCoalescer {
        &self.batch
    }

    pub fn tracker(&self) -> &ToolExecutionTracker {
        &self.tracker
    }

    pub fn stream(&self) -> &ChatStreamClient {
        &self.stream
    }

    pub fn events(&self) -> &Topic<NetworkEvent> {
        &self.events
    }
}
