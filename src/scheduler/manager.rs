//! Task scheduler
//!
//! First-fit placement over the peer table in insertion order: the first
//! live peer whose reported usage plus the task's declared headroom stays
//! within 100% on both CPU and memory wins. The capacity check is
//! instantaneous and best-effort, not a reservation.
//!
//! Terminal `task_status` frames are multiplexed off each link's reader and
//! routed here by task id; there is no per-task polling. Tasks that find no
//! peer stay pending and are not re-examined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::peer::ConnectionManager;
use crate::protocol::{TaskRequest, TaskStatus, TaskStatusUpdate, WireMessage};

use super::{TaskRecord, TaskView};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deadline for a terminal status after assignment; zero disables
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Scheduler
// ─────────────────────────────────────────────────────────────────

/// Accepts submissions and tracks every task to a terminal state.
///
/// Arguments and results cross the wire as JSON; values that do not
/// round-trip through JSON are outside the contract.
pub struct TaskScheduler {
    config: SchedulerConfig,
    connections: Arc<ConnectionManager>,
    tasks: Arc<Mutex<HashMap<String, TaskRecord>>>,
    next_task_id: AtomicU64,
}

impl TaskScheduler {
    /// Create a scheduler sending over the given links
    pub fn new(config: SchedulerConfig, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Submit a task for distributed execution and attempt to place it
    /// immediately. Returns the task id.
    pub async fn submit_task(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        required_cpu: f32,
        required_memory: f32,
    ) -> String {
        let id = format!("task_{}", self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let record = TaskRecord::new(
            id.clone(),
            function.into(),
            args,
            kwargs,
            required_cpu,
            required_memory,
        );
        self.tasks.lock().insert(id.clone(), record);
        info!(task_id = %id, "Task submitted");

        self.schedule(&id).await;
        id
    }

    /// One placement pass for a pending task
    async fn schedule(&self, task_id: &str) {
        let (function, args, kwargs, required_cpu, required_memory) = {
            let tasks = self.tasks.lock();
            match tasks.get(task_id) {
                Some(t) if t.state == super::TaskState::Pending => (
                    t.function.clone(),
                    t.args.clone(),
                    t.kwargs.clone(),
                    t.required_cpu,
                    t.required_memory,
                ),
                _ => return,
            }
        };

        let chosen = self.find_available_peer(required_cpu, required_memory);
        let peer = match chosen {
            Some(peer) => peer,
            None => {
                warn!(task_id = %task_id, "No available peers for task");
                return;
            }
        };

        // Mark running before the frame leaves so a fast reply can never
        // race the transition.
        if !self.with_task(task_id, |t| t.mark_running(peer.as_str())) {
            return;
        }

        let request = WireMessage::Task(TaskRequest {
            task_id: task_id.to_string(),
            function,
            args,
            kwargs,
            required_cpu,
            required_memory,
        });

        match self.connections.send(&peer, request).await {
            Ok(()) => {
                info!(task_id = %task_id, peer = %peer, "Task assigned");
                self.spawn_deadline(task_id.to_string());
            }
            Err(e) => {
                warn!(task_id = %task_id, peer = %peer, error = %e, "Failed to send task");
                self.with_task(task_id, |t| t.mark_failed(e.to_string()));
            }
        }
    }

    /// First-fit over live peers in insertion order
    fn find_available_peer(&self, required_cpu: f32, required_memory: f32) -> Option<String> {
        self.connections
            .table()
            .in_order()
            .into_iter()
            .filter(|p| p.active)
            .find(|p| {
                p.hardware.cpu_percent + required_cpu <= 100.0
                    && p.hardware.memory_percent + required_memory <= 100.0
            })
            .map(|p| p.hostname)
    }

    /// Fail the task if no terminal status arrives within the deadline
    fn spawn_deadline(&self, task_id: String) {
        if self.config.task_timeout.is_zero() {
            return;
        }
        let tasks = Arc::clone(&self.tasks);
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = tasks
                .lock()
                .get_mut(&task_id)
                .map(|t| {
                    t.mark_failed(format!(
                        "Task timed out after {} seconds",
                        timeout.as_secs()
                    ))
                })
                .unwrap_or(false);
            if timed_out {
                warn!(task_id = %task_id, "Task deadline elapsed");
            }
        });
    }

    /// Consume a terminal status frame routed from a peer link
    pub fn handle_status(&self, update: TaskStatusUpdate) {
        match update.status {
            Some(TaskStatus::Completed) => {
                let result = update.result.unwrap_or(Value::Null);
                if self.with_task(&update.task_id, |t| t.mark_completed(result)) {
                    info!(task_id = %update.task_id, "Task completed");
                }
            }
            Some(TaskStatus::Failed) => {
                let error = update
                    .error
                    .unwrap_or_else(|| "Unknown failure".to_string());
                if self.with_task(&update.task_id, |t| t.mark_failed(error.clone())) {
                    warn!(task_id = %update.task_id, error = %error, "Task failed");
                }
            }
            other => {
                debug!(task_id = %update.task_id, status = ?other, "Ignoring non-terminal status");
            }
        }
    }

    /// Fail every running task assigned to a dead peer
    pub fn peer_lost(&self, hostname: &str) {
        let mut tasks = self.tasks.lock();
        for task in tasks.values_mut() {
            if task.state == super::TaskState::Running
                && task.assigned_peer.as_deref() == Some(hostname)
            {
                warn!(task_id = %task.id, peer = %hostname, "Failing task: peer lost");
                task.mark_failed(format!("Connection to peer {hostname} lost"));
            }
        }
    }

    /// Status triple for one task, if it exists
    pub fn get_task_status(&self, task_id: &str) -> Option<TaskView> {
        self.tasks.lock().get(task_id).map(|t| t.view())
    }

    /// Status snapshot of every task ever submitted
    pub fn get_all_tasks(&self) -> HashMap<String, TaskView> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, t)| (id.clone(), t.view()))
            .collect()
    }

    /// Apply a mutation to one task record; returns the mutation's result,
    /// or false if the task does not exist
    fn with_task<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskRecord) -> bool,
    {
        let mut tasks = self.tasks.lock();
        tasks.get_mut(task_id).map(f).unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
