use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

/// Stable node identifier inside a graph.
pub type NodeId = u64;

/// Attribute mapping carried by nodes, edges and task payloads.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

/// Lifecycle state of a task node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ready,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }

    /// Failed or aborted.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Aborted)
    }

    /// Whether a task may move from this status to `next`. Completed is
    /// final; failed and aborted tasks only go back to ready.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Ready, Running | Completed | Failed | Aborted)
                    | (Running, Completed | Failed | Aborted)
                    | (Failed | Aborted, Ready)
            )
    }
}

impl FromStr for TaskStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                FlowError::Validation(format!(
                    "status '{}' is not one of ready, running, completed, failed, aborted",
                    s
                ))
            })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a task runner gets to see about the task it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub nid: NodeId,
    pub task_id: Uuid,
    pub task_name: String,
    pub task_type: String,
    /// Full node attribute set at dispatch time.
    pub metadata: Attrs,
    /// Resolved input: own input_data merged with upstream outputs.
    pub input: Attrs,
    pub configuration: Attrs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl TaskRequest {
    /// String value of a metadata attribute.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Result returned by a task runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Attrs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskResult {
    pub fn completed(output: Attrs) -> Self {
        Self {
            status: TaskStatus::Completed,
            output,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: Attrs::new(),
            message: Some(message.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Events emitted by the workflow engine.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Engine run loop started.
    RunStarted { workflow: String },
    /// Task dispatched to its runner.
    TaskStarted { nid: NodeId, task: String },
    /// Task finished successfully.
    TaskCompleted { nid: NodeId, task: String, elapsed_ms: u64 },
    /// Task failed and has no retries left.
    TaskFailed { nid: NodeId, task: String, message: String },
    /// Task failed and was reset to ready for another attempt.
    TaskRetrying { nid: NodeId, task: String, retries_left: u64 },
    /// Engine halted in front of a breakpointed task.
    BreakpointReached { nid: NodeId, task: String },
    /// Engine run loop stopped.
    RunFinished { completed: bool, failed: bool },
    /// Workflow was cancelled.
    Cancelled,
}

/// Current UTC time in the RFC 3339 form stored on task nodes.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("done".parse::<TaskStatus>().is_err());
        assert!("Ready".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Aborted).unwrap();
        assert_eq!(json, "\"aborted\"");
        let back: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(back, TaskStatus::Running);
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Ready));
        assert!(Aborted.can_transition_to(Ready));
        assert!(Completed.can_transition_to(Completed));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Ready));
        assert!(!Running.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Aborted.can_transition_to(Running));
    }

    #[test]
    fn test_task_result_constructors() {
        let ok = TaskResult::completed(Attrs::new());
        assert!(ok.is_completed());
        let failed = TaskResult::failed("boom");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_task_request_json_carries_task_id() {
        let request = TaskRequest {
            nid: 3,
            task_id: uuid::Uuid::new_v4(),
            task_name: "add".into(),
            task_type: "PythonTask".into(),
            metadata: Attrs::new(),
            input: Attrs::new(),
            configuration: Attrs::new(),
            workdir: Some("/tmp/task-3".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["task_id"], serde_json::json!(request.task_id.to_string()));

        let back: TaskRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.task_id, request.task_id);
        assert_eq!(back.workdir.as_deref(), Some("/tmp/task-3"));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = timestamp_now();
        assert!(parse_timestamp(&ts).is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
