//! Tool execution lifecycle: `starting -> executing -> {completed | error}`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Starting,
    Executing,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Inputs that move an execution through its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    /// The short delay after creation elapsed.
    Started { action_label: String },
    /// Another non-completion marker for the same tool.
    Progressed { details: HashMap<String, String> },
    Completed,
    Failed { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("Execution {id} already finished as {status:?}")]
    TerminalState { id: String, status: ToolStatus },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// 0..=100
    pub progress: u8,
    pub details: HashMap<String, String>,
}

impl ToolExecution {
    pub fn new(tool_name: impl Into<String>, details: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            status: ToolStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            progress: 0,
            details,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn action_label(&self) -> Option<&str> {
        self.details.get("action").map(String::as_str)
    }

    /// Apply `event`. Terminal executions reject every event.
    pub fn apply(&mut self, event: ToolEvent) -> Result<ToolStatus, TransitionError> {
        use ToolStatus::*;

        if self.is_terminal() {
            return Err(TransitionError::TerminalState {
                id: self.id.clone(),
                status: self.status,
            });
        }

        match event {
            ToolEvent::Started { action_label } => {
                if self.status == Starting {
                    self.status = Executing;
                    self.progress = self.progress.max(50);
                }
                self.details.insert("action".to_string(), action_label);
            }
            ToolEvent::Progressed { details } => {
                self.details.extend(details);
                self.status = Executing;
                self.progress = self.progress.max(75);
            }
            ToolEvent::Completed => {
                self.status = Completed;
                self.progress = 100;
                self.end_time = Some(Utc::now());
            }
            ToolEvent::Failed { reason } => {
                self.status = Error;
                self.end_time = Some(Utc::now());
                self.details.insert("error".to_string(), reason);
            }
        }
        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> ToolEvent {
        ToolEvent::Started {
            action_label: "Searching the web".to_string(),
        }
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut exec = ToolExecution::new("web_search", HashMap::new());
        assert_eq!(exec.status, ToolStatus::Starting);
        assert_eq!(exec.progress, 0);

        assert_eq!(exec.apply(started()), Ok(ToolStatus::Executing));
        assert_eq!(exec.progress, 50);
        assert_eq!(exec.action_label(), Some("Searching the web"));

        assert_eq!(exec.apply(ToolEvent::Completed), Ok(ToolStatus::Completed));
        assert_eq!(exec.progress, 100);
        assert!(exec.end_time.is_some());
    }

    #[test]
    fn progress_merges_details_and_never_goes_backwards() {
        let mut exec = ToolExecution::new("web_search", HashMap::new());
        let details = HashMap::from([("query".to_string(), "dogs".to_string())]);
        exec.apply(ToolEvent::Progressed { details }).unwrap();
        assert_eq!(exec.progress, 75);

        // A late start bump keeps the higher progress.
        exec.apply(started()).unwrap();
        assert_eq!(exec.progress, 75);
        assert_eq!(exec.details.get("query").map(String::as_str), Some("dogs"));
    }

    #[test]
    fn terminal_states_reject_events() {
        let mut exec = ToolExecution::new("music_recommendation", HashMap::new());
        exec.apply(ToolEvent::Failed {
            reason: "timeout".to_string(),
        })
        .unwrap();
        assert_eq!(exec.status, ToolStatus::Error);

        let err = exec.apply(ToolEvent::Completed).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::TerminalState {
                status: ToolStatus::Error,
                ..
            }
        ));
    }

    #[test]
    fn serializes_camel_case() {
        let exec = ToolExecution::new("weather", HashMap::new());
        let value = serde_json::to_value(&exec).unwrap();
        assert_eq!(value["toolName"], "weather");
        assert_eq!(value["status"], "starting");
        assert!(value["endTime"].is_null());
    }
}
