//! Task records and their state machine
//!
//! State is monotonic: pending → running → {completed, failed}, with
//! pending → failed permitted. Back-transitions are refused.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Scheduler-local task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted, no peer assigned
    Pending,
    /// Sent to a peer that was live at assignment time
    Running,
    /// Terminal: the handler returned a value
    Completed,
    /// Terminal: handler error, rejection, transport failure, or deadline
    Failed,
}

impl TaskState {
    /// Wire/display form of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Record
// ─────────────────────────────────────────────────────────────────

/// One submitted task, retained for its whole history
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Task id, unique within this node
    pub id: String,

    /// Name of the handler to invoke remotely
    pub function: String,

    /// Positional arguments
    pub args: Vec<Value>,

    /// Keyword arguments
    pub kwargs: Map<String, Value>,

    /// Declared CPU headroom, percent of capacity
    pub required_cpu: f32,

    /// Declared memory headroom, percent of capacity
    pub required_memory: f32,

    /// Current lifecycle state
    pub state: TaskState,

    /// Handler return value, set on completion
    pub result: Option<Value>,

    /// Failure description, set on failure
    pub error: Option<String>,

    /// Hostname the task was sent to, set at assignment
    pub assigned_peer: Option<String>,

    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a pending record for a fresh submission
    pub fn new(
        id: String,
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        required_cpu: f32,
        required_memory: f32,
    ) -> Self {
        Self {
            id,
            function,
            args,
            kwargs,
            required_cpu,
            required_memory,
            state: TaskState::Pending,
            result: None,
            error: None,
            assigned_peer: None,
            created_at: Utc::now(),
        }
    }

    /// Transition pending → running at assignment. Returns false if the
    /// record was not pending.
    pub fn mark_running(&mut self, peer: impl Into<String>) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Running;
        self.assigned_peer = Some(peer.into());
        true
    }

    /// Transition to completed with the handler's return value. Only valid
    /// from running.
    pub fn mark_completed(&mut self, result: Value) -> bool {
        if self.state != TaskState::Running {
            return false;
        }
        self.state = TaskState::Completed;
        self.result = Some(result);
        true
    }

    /// Transition to failed. Valid from pending or running.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        true
    }

    /// The status triple exposed to callers
    pub fn view(&self) -> TaskView {
        TaskView {
            status: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            assigned_peer: self.assigned_peer.clone(),
        }
    }
}

/// Status snapshot returned by lookups
#[derive(Debug, Clone)]
pub struct TaskView {
    pub status: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub assigned_peer: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> TaskRecord {
        TaskRecord::new(
            id.to_string(),
            "square".to_string(),
            vec![json!(5)],
            Map::new(),
            0.0,
            0.0,
        )
    }

    #[test]
    fn test_new_record_invariants() {
        let task = record("task_0");
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.assigned_peer.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_happy_lifecycle() {
        let mut task = record("task_0");
        assert!(task.mark_running("node-b"));
        assert_eq!(task.assigned_peer.as_deref(), Some("node-b"));

        assert!(task.mark_completed(json!(25)));
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result, Some(json!(25)));
    }

    #[test]
    fn test_pending_to_failed_permitted() {
        let mut task = record("task_0");
        assert!(task.mark_failed("send error"));
        assert_eq!(task.state, TaskState::Failed);
    }

    #[test]
    fn test_no_back_transitions() {
        let mut task = record("task_0");
        task.mark_running("node-b");
        task.mark_completed(json!(1));

        assert!(!task.mark_failed("late failure"));
        assert!(!task.mark_running("node-c"));
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_completed_requires_running() {
        let mut task = record("task_0");
        assert!(!task.mark_completed(json!(1)));
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(TaskState::Pending.as_str(), "pending");
        assert_eq!(TaskState::Failed.to_string(), "failed");
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
