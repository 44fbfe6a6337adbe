use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_core::{Topic, TrackerConfig};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use crate::execution::{ToolEvent, ToolExecution, ToolStatus};
use crate::markers::MarkerTable;

/// Published on every lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "execution", rename_all = "snake_case")]
pub enum ToolExecutionEvent {
    Created(ToolExecution),
    Updated(ToolExecution),
    Completed(ToolExecution),
    Failed(ToolExecution),
    Cleared,
}

impl ToolExecutionEvent {
    pub fn execution(&self) -> Option<&ToolExecution> {
        match self {
            Self::Created(e) | Self::Updated(e) | Self::Completed(e) | Self::Failed(e) => Some(e),
            Self::Cleared => None,
        }
    }
}

/// Receives finished executions of hand-off tools (e.g. music
/// recommendations). Called from a detached task; the tracker never waits.
#[async_trait]
pub trait ResultAggregator: Send + Sync {
    async fn on_tool_completed(&self, execution: ToolExecution);
}

struct Inner {
    table: MarkerTable,
    start_delay: Duration,
    auto_complete: Duration,
    max_executions: usize,
    handoff_tools: HashSet<String>,
    executions: RwLock<Vec<ToolExecution>>,
    events: Topic<ToolExecutionEvent>,
    aggregator: Option<Arc<dyn ResultAggregator>>,
}

/// Infers tool executions from streamed text and tracks their lifecycle.
///
/// At most one non-terminal execution exists per tool name.
#[derive(Clone)]
pub struct ToolExecutionTracker {
    inner: Arc<Inner>,
}

impl ToolExecutionTracker {
    pub fn new(table: MarkerTable, config: &TrackerConfig) -> Self {
        Self::build(table, config, None)
    }

    pub fn with_aggregator(
        table: MarkerTable,
        config: &TrackerConfig,
        aggregator: Arc<dyn ResultAggregator>,
    ) -> Self {
        Self::build(table, config, Some(aggregator))
    }

    fn build(
        table: MarkerTable,
        config: &TrackerConfig,
        aggregator: Option<Arc<dyn ResultAggregator>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                start_delay: Duration::from_millis(config.start_delay_ms),
                auto_complete: Duration::from_millis(config.auto_complete_ms),
                max_executions: config.max_executions.max(1),
                handoff_tools: config.handoff_tools.iter().cloned().collect(),
                executions: RwLock::new(Vec::new()),
                events: Topic::new(256),
                aggregator,
            }),
        }
    }

    pub fn table(&self) -> &MarkerTable {
        &self.inner.table
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &Topic<ToolExecutionEvent> {
        &self.inner.events
    }

    /// Match one fragment against the marker table and act on the first hit.
    /// Returns the execution that was created or changed.
    pub async fn observe(&self, fragment: &str) -> Option<ToolExecution> {
        let hit = self.inner.table.first_match(fragment)?;
        let mut executions = self.inner.executions.write().await;

        let live = executions
            .iter()
            .find(|e| e.tool_name == hit.tool_name && !e.is_terminal())
            .map(|e| e.id.clone());

        match (live, hit.is_completion) {
            (Some(id), true) => {
                drop(executions);
                self.inner.transition(&id, ToolEvent::Completed).await
            }
            (Some(id), false) => {
                drop(executions);
                self.inner
                    .transition(&id, ToolEvent::Progressed {
                        details: hit.details,
                    })
                    .await
            }
            (None, true) => {
                debug!("Completion marker for {} with nothing running", hit.tool_name);
                None
            }
            (None, false) => {
                let execution = ToolExecution::new(hit.tool_name.clone(), hit.details);
                info!("Tool {} started ({})", execution.tool_name, execution.id);
                executions.push(execution.clone());
                self.inner.collect_garbage(&mut executions);
                drop(executions);

                self.inner
                    .events
                    .publish(ToolExecutionEvent::Created(execution.clone()));
                self.schedule(execution.id.clone(), hit.action_label);
                Some(execution)
            }
        }
    }

    /// Bump to executing shortly after creation, then assume success after
    /// the dwell. Both steps are no-ops once the execution is terminal.
    fn schedule(&self, id: String, action_label: String) {
        let inner = Arc::clone(&self.inner);
        let created = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep_until(created + inner.start_delay).await;
            inner.transition(&id, ToolEvent::Started { action_label }).await;

            tokio::time::sleep_until(created + inner.auto_complete).await;
            if inner.transition(&id, ToolEvent::Completed).await.is_some() {
                debug!("Auto-completed tool execution {id}");
            }
        });
    }

    /// Mark the running execution of `tool_name` completed.
    pub async fn complete(&self, tool_name: &str) -> Option<ToolExecution> {
        let id = self.live_id(tool_name).await?;
        self.inner.transition(&id, ToolEvent::Completed).await
    }

    /// Mark the running execution of `tool_name` failed.
    pub async fn fail(&self, tool_name: &str, reason: impl Into<String>) -> Option<ToolExecution> {
        let id = self.live_id(tool_name).await?;
        self.inner
            .transition(&id, ToolEvent::Failed {
                reason: reason.into(),
            })
            .await
    }

    async fn live_id(&self, tool_name: &str) -> Option<String> {
        self.inner
            .executions
            .read()
            .await
            .iter()
            .find(|e| e.tool_name == tool_name && !e.is_terminal())
            .map(|e| e.id.clone())
    }

    pub async fn execution(&self, id: &str) -> Option<ToolExecution> {
        self.inner
            .executions
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Every tracked execution, oldest first.
    pub async fn executions(&self) -> Vec<ToolExecution> {
        self.inner.executions.read().await.clone()
    }

    pub async fn active_executions(&self) -> Vec<ToolExecution> {
        self.inner
            .executions
            .read()
            .await
            .iter()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.executions.write().await.clear();
        self.inner.events.publish(ToolExecutionEvent::Cleared);
    }
}

impl Inner {
    async fn transition(&self, id: &str, event: ToolEvent) -> Option<ToolExecution> {
        let snapshot = {
            let mut executions = self.executions.write().await;
            // Gone after a clear or garbage collection.
            let execution = executions.iter_mut().find(|e| e.id == id)?;
            if let Err(err) = execution.apply(event) {
                debug!("Ignoring tool event: {err}");
                return None;
            }
            execution.clone()
        };

        match snapshot.status {
            ToolStatus::Completed => {
                info!("Tool {} completed ({})", snapshot.tool_name, snapshot.id);
                self.events
                    .publish(ToolExecutionEvent::Completed(snapshot.clone()));
                self.hand_off(&snapshot);
            }
            ToolStatus::Error => {
                warn!("Tool {} failed ({})", snapshot.tool_name, snapshot.id);
                self.events.publish(ToolExecutionEvent::Failed(snapshot.clone()));
            }
            ToolStatus::Starting | ToolStatus::Executing => {
                self.events.publish(ToolExecutionEvent::Updated(snapshot.clone()));
            }
        }
        Some(snapshot)
    }

    fn hand_off(&self, execution: &ToolExecution) {
        let Some(aggregator) = &self.aggregator else {
            return;
        };
        if !self.handoff_tools.contains(&execution.tool_name) {
            return;
        }
        let aggregator = Arc::clone(aggregator);
        let execution = execution.clone();
        tokio::spawn(async move {
            aggregator.on_tool_completed(execution).await;
        });
    }

    /// Drop the oldest executions beyond the cap, finished ones first.
    fn collect_garbage(&self, executions: &mut Vec<ToolExecution>) {
        while executions.len() > self.max_executions {
            let idx = executions
                .iter()
                .position(ToolExecution::is_terminal)
                .unwrap_or(0);
            let removed = executions.remove(idx);
            debug!("Evicted tool execution {} ({})", removed.id, removed.tool_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::MarkerRule;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn tracker() -> ToolExecutionTracker {
        ToolExecutionTracker::new(MarkerTable::default(), &TrackerConfig::default())
    }

    async fn live_count(tracker: &ToolExecutionTracker, tool: &str) -> usize {
        tracker
            .active_executions()
            .await
            .iter()
            .filter(|e| e.tool_name == tool)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_web_search_auto_completes_then_recreates() {
        let tracker = tracker();
        let first = tracker
            .observe("🔍 Searching the web for: cats")
            .await
            .unwrap();
        assert_eq!(first.tool_name, "web_search");
        assert_eq!(first.status, ToolStatus::Starting);
        assert_eq!(first.details.get("query").map(String::as_str), Some("cats"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let running = tracker.execution(&first.id).await.unwrap();
        assert_eq!(running.status, ToolStatus::Executing);
        assert_eq!(running.progress, 50);
        assert_eq!(running.action_label(), Some("Searching the web"));

        tokio::time::sleep(Duration::from_millis(1_400)).await;
        let done = tracker.execution(&first.id).await.unwrap();
        assert_eq!(done.status, ToolStatus::Completed);
        assert_eq!(done.progress, 100);

        let second = tracker
            .observe("🔍 Searching the web for: dogs")
            .await
            .unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, ToolStatus::Starting);
        assert_eq!(tracker.executions().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_marker_finishes_before_dwell() {
        let tracker = tracker();
        let exec = tracker
            .observe("🔍 Searching the web for: rust")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let done = tracker.observe("✅ Search complete").await.unwrap();
        assert_eq!(done.id, exec.id);
        assert_eq!(done.status, ToolStatus::Completed);
        let end_time = done.end_time;

        // The pending auto-complete is a no-op now.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after = tracker.execution(&exec.id).await.unwrap();
        assert_eq!(after.status, ToolStatus::Completed);
        assert_eq!(after.end_time, end_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_marker_updates_instead_of_duplicating() {
        let tracker = tracker();
        let exec = tracker
            .observe("🔍 Searching the web for: cats")
            .await
            .unwrap();
        let updated = tracker
            .observe("🔍 Searching the web for: cat food")
            .await
            .unwrap();

        assert_eq!(updated.id, exec.id);
        assert_eq!(updated.progress, 75);
        assert_eq!(
            updated.details.get("query").map(String::as_str),
            Some("cat food")
        );
        assert_eq!(tracker.executions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_live_execution_per_tool() {
        let tracker = tracker();
        let script = [
            ("🔍 Searching the web for: a", 30),
            ("🎵 Finding music for: rain", 40),
            ("🔍 Searching the web for: b", 400),
            ("plain text", 10),
            ("✅ Search complete", 20),
            ("🔍 Searching the web for: c", 1_600),
            ("🔍 Searching the web for: d", 50),
            ("🎶 Here are some songs", 10),
            ("🎵 Finding music for: sun", 2_000),
        ];
        for (fragment, pause_ms) in script {
            tracker.observe(fragment).await;
            for tool in ["web_search", "music_recommendation"] {
                assert!(live_count(&tracker, tool).await <= 1);
            }
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
            for tool in ["web_search", "music_recommendation"] {
                assert!(live_count(&tracker, tool).await <= 1);
            }
        }
        assert!(tracker.active_executions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_without_live_execution_is_ignored() {
        let tracker = tracker();
        assert!(tracker.observe("✅ Search complete").await.is_none());
        assert!(tracker.executions().await.is_empty());
    }

    struct ChannelAggregator(mpsc::UnboundedSender<ToolExecution>);

    #[async_trait]
    impl ResultAggregator for ChannelAggregator {
        async fn on_tool_completed(&self, execution: ToolExecution) {
            let _ = self.0.send(execution);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_music_completion_is_handed_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ToolExecutionTracker::with_aggregator(
            MarkerTable::default(),
            &TrackerConfig::default(),
            Arc::new(ChannelAggregator(tx)),
        );

        tracker.observe("🔍 Searching the web for: x").await;
        tracker.observe("✅ Search complete").await;
        tracker.observe("🎵 Finding music for: focus").await;
        tracker.observe("🎶 Here are some tracks").await;

        let handed = rx.recv().await.unwrap();
        assert_eq!(handed.tool_name, "music_recommendation");
        assert_eq!(handed.status, ToolStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_the_lifecycle() {
        let tracker = tracker();
        let mut events = tracker.subscribe();

        tracker.observe("📅 Checking your calendar").await;
        tracker.fail("calendar", "permission denied").await;

        assert!(matches!(events.recv().await.unwrap(), ToolExecutionEvent::Created(_)));
        match events.recv().await.unwrap() {
            ToolExecutionEvent::Failed(exec) => {
                assert_eq!(exec.status, ToolStatus::Error);
                assert_eq!(
                    exec.details.get("error").map(String::as_str),
                    Some("permission denied")
                );
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        // Timers for the failed execution stay silent.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped() {
        let table = MarkerTable::new(
            1,
            vec![
                MarkerRule::new("^go$", "job", "Working", false).unwrap(),
                MarkerRule::new("^done$", "job", "Done", true).unwrap(),
            ],
        );
        let tracker = ToolExecutionTracker::new(table, &TrackerConfig::default());
        for _ in 0..60 {
            tracker.observe("go").await.unwrap();
            tracker.observe("done").await.unwrap();
        }
        let executions = tracker.executions().await;
        assert_eq!(executions.len(), 50);
        assert!(executions.iter().all(|e| e.status == ToolStatus::Completed));

        tracker.clear().await;
        assert!(tracker.executions().await.is_empty());
    }

    #[test]
    fn event_exposes_execution() {
        let exec = ToolExecution::new("memory", HashMap::new());
        assert_eq!(
            ToolExecutionEvent::Updated(exec.clone()).execution(),
            Some(&exec)
        );
        assert_eq!(ToolExecutionEvent::Cleared.execution(), None);
    }
}
