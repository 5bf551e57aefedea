//! Protocol message definitions
//!
//! All message kinds for peer-to-peer communication. Messages are serialized
//! as a JSON object `{"type": <kind>, "data": <object>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hardware::HardwareSnapshot;

// ─────────────────────────────────────────────────────────────────
// Message Envelope (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All peer-link messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireMessage {
    /// First frame in each direction on a new link; carries the sender's
    /// hardware snapshot including its hostname.
    Handshake(HardwareSnapshot),

    /// A computation routed to this peer for execution.
    Task(TaskRequest),

    /// A status report for a task, or a status poll when `status` is absent.
    TaskStatus(TaskStatusUpdate),
}

impl WireMessage {
    /// Get the message kind name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Handshake(_) => "handshake",
            WireMessage::Task(_) => "task",
            WireMessage::TaskStatus(_) => "task_status",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Messages
// ─────────────────────────────────────────────────────────────────

/// A task dispatched from the scheduler to a worker peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task id, unique within the submitting node
    pub task_id: String,

    /// Name of the registered handler to invoke
    pub function: String,

    /// Positional arguments (JSON-encodable values)
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments (JSON-encodable values)
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// CPU headroom the task expects to consume, in percent of capacity
    #[serde(default)]
    pub required_cpu: f32,

    /// Memory headroom the task expects to consume, in percent of capacity
    #[serde(default)]
    pub required_memory: f32,
}

/// Lifecycle state of a task as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Stub reply to a status poll; never a stored task state
    Acknowledged,
}

impl TaskStatus {
    /// Whether this status ends a task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Task status report or poll.
///
/// A frame without a `status` field is a status poll request; the executor
/// answers it with `acknowledged`. Terminal reports carry `result` on
/// `completed` and `error` on `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    /// Task id this update refers to
    pub task_id: String,

    /// Reported status; absent in poll requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    /// Handler return value, only meaningful with `completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure description, only meaningful with `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatusUpdate {
    /// Build a status poll request for a task
    pub fn poll(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: None,
            result: None,
            error: None,
        }
    }

    /// Build a completion report carrying the handler's return value
    pub fn completed(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: Some(TaskStatus::Completed),
            result: Some(result),
            error: None,
        }
    }

    /// Build a failure report carrying a textual error
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: Some(TaskStatus::Failed),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Build the stub reply to a status poll
    pub fn acknowledged(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: Some(TaskStatus::Acknowledged),
            result: None,
            error: None,
        }
    }

    /// Whether this update carries a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
