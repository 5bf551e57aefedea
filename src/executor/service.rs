//! Task executor service
//!
//! Drains executor-bound frames off the node's dispatch loop so a slow
//! handler can never stall a link reader. Each accepted task runs on the
//! blocking worker pool; the reply is emitted exactly once, through the
//! owning link's writer task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hardware::HardwareProbe;
use crate::peer::ConnectionManager;
use crate::protocol::{TaskRequest, TaskStatusUpdate, WireMessage};

use super::{HandlerRegistry, HandlerResult};

/// Executor-bound work routed off a peer link
#[derive(Debug)]
pub enum ExecutorRequest {
    /// A task to run on behalf of a peer
    Task { from: String, request: TaskRequest },

    /// A status poll to acknowledge
    StatusPoll { from: String, task_id: String },
}

/// Runs registered handlers on behalf of requesting peers
pub struct TaskExecutor {
    core: ExecutorCore,
    inbound_tx: mpsc::Sender<ExecutorRequest>,
    inbound_rx: Mutex<Option<mpsc::Receiver<ExecutorRequest>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// State shared with the consume loop and every running task
#[derive(Clone)]
struct ExecutorCore {
    registry: Arc<HandlerRegistry>,
    probe: Arc<HardwareProbe>,
    connections: Arc<ConnectionManager>,
    running: Arc<AtomicUsize>,
}

impl TaskExecutor {
    /// Create an executor backed by the given registry, probe, and links
    pub fn new(
        registry: Arc<HandlerRegistry>,
        probe: Arc<HardwareProbe>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Self {
            core: ExecutorCore {
                registry,
                probe,
                connections,
                running: Arc::new(AtomicUsize::new(0)),
            },
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            cancel: Mutex::new(None),
        }
    }

    /// Queue feeding this executor; the node's router writes to it
    pub fn inbound(&self) -> mpsc::Sender<ExecutorRequest> {
        self.inbound_tx.clone()
    }

    /// Register a handler under a name
    pub fn register_task_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.core.registry.register(name, handler);
    }

    /// Number of tasks currently executing
    pub fn running_count(&self) -> usize {
        self.core.running.load(Ordering::Relaxed)
    }

    /// Start consuming executor-bound requests. Idempotent.
    pub fn start(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let core = self.core.clone();
        let run_token = token.clone();
        let mut inbound_rx = match self.inbound_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = run_token.cancelled() => break,
                    request = inbound_rx.recv() => match request {
                        Some(ExecutorRequest::Task { from, request }) => {
                            let core = core.clone();
                            tokio::spawn(async move {
                                core.handle_task(from, request).await;
                            });
                        }
                        Some(ExecutorRequest::StatusPoll { from, task_id }) => {
                            core.handle_status_poll(&from, task_id).await;
                        }
                        None => break,
                    }
                }
            }
            debug!("Task executor loop stopped");
        });

        *cancel = Some(token);
        info!("Task executor started");
    }

    /// Stop consuming requests. Tasks already running finish and reply.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
            info!("Task executor stopped");
        }
    }
}

impl ExecutorCore {
    /// Run one task and reply with its terminal status
    async fn handle_task(&self, from: String, request: TaskRequest) {
        let task_id = request.task_id.clone();

        let handler = match self.registry.get(&request.function) {
            Some(handler) => handler,
            None => {
                warn!(task_id = %task_id, function = %request.function, "Unknown function");
                self.reply(
                    &from,
                    TaskStatusUpdate::failed(
                        task_id,
                        format!("Unknown function: {}", request.function),
                    ),
                )
                .await;
                return;
            }
        };

        if !self
            .probe
            .resource_available(request.required_cpu, request.required_memory)
            .await
        {
            warn!(
                task_id = %task_id,
                required_cpu = request.required_cpu,
                required_memory = request.required_memory,
                "Rejecting task: insufficient resources"
            );
            self.reply(&from, TaskStatusUpdate::failed(task_id, "Insufficient resources"))
                .await;
            return;
        }

        info!(task_id = %task_id, function = %request.function, peer = %from, "Executing task");
        self.running.fetch_add(1, Ordering::Relaxed);

        let args = request.args;
        let kwargs = request.kwargs;
        let outcome = tokio::task::spawn_blocking(move || handler(args, kwargs)).await;

        self.running.fetch_sub(1, Ordering::Relaxed);

        let update = match outcome {
            Ok(Ok(result)) => {
                info!(task_id = %task_id, "Task completed");
                TaskStatusUpdate::completed(task_id, result)
            }
            Ok(Err(message)) => {
                warn!(task_id = %task_id, error = %message, "Task handler failed");
                TaskStatusUpdate::failed(task_id, message)
            }
            Err(join_error) => {
                error!(task_id = %task_id, error = %join_error, "Task handler panicked");
                TaskStatusUpdate::failed(task_id, join_error.to_string())
            }
        };

        self.reply(&from, update).await;
    }

    /// Answer a status poll with the acknowledgement stub.
    ///
    /// The executor does not track in-flight task state for polling; the
    /// real terminal frame is sent by `handle_task` when the handler
    /// returns.
    async fn handle_status_poll(&self, from: &str, task_id: String) {
        self.reply(from, TaskStatusUpdate::acknowledged(task_id)).await;
    }

    /// Send one status frame back to the requesting peer
    async fn reply(&self, to: &str, update: TaskStatusUpdate) {
        if let Err(e) = self
            .connections
            .send(to, WireMessage::TaskStatus(update))
            .await
        {
            debug!(peer = %to, error = %e, "Failed to send task status");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionConfig, PeerEvent, PeerTable};
    use crate::protocol::TaskStatus;
    use serde_json::json;
    use std::time::Duration;

    struct TestNode {
        connections: Arc<ConnectionManager>,
        events: mpsc::Receiver<PeerEvent>,
        probe: Arc<HardwareProbe>,
    }

    fn test_node(name: &str, port: u16) -> TestNode {
        let (event_tx, events) = mpsc::channel(64);
        let probe = Arc::new(
            HardwareProbe::new(name).with_sample_window(Duration::from_millis(50)),
        );
        let connections = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                listen_port: port,
                ..ConnectionConfig::default()
            },
            Arc::clone(&probe),
            Arc::new(PeerTable::new()),
            event_tx,
        ));
        TestNode {
            connections,
            events,
            probe,
        }
    }

    /// Wire a worker (listening) and a submitter (dialing); the worker's
    /// inbound frames are routed into the executor the way the node
    /// dispatch loop would.
    async fn worker_and_submitter() -> (Arc<TaskExecutor>, TestNode) {
        let worker = test_node("worker-host", 0);
        let addr = worker.connections.start_server().await.unwrap();

        let submitter = test_node("submitter-host", addr.port());
        assert!(
            submitter
                .connections
                .connect_to_node("worker-host", addr.ip())
                .await
        );

        let executor = Arc::new(TaskExecutor::new(
            Arc::new(HandlerRegistry::new()),
            Arc::clone(&worker.probe),
            Arc::clone(&worker.connections),
        ));
        executor.start();

        let inbound = executor.inbound();
        let mut worker_events = worker.events;
        tokio::spawn(async move {
            while let Some(event) = worker_events.recv().await {
                if let PeerEvent::Frame { from, message } = event {
                    match message {
                        WireMessage::Task(request) => {
                            let _ = inbound.send(ExecutorRequest::Task { from, request }).await;
                        }
                        WireMessage::TaskStatus(update) if update.status.is_none() => {
                            let _ = inbound
                                .send(ExecutorRequest::StatusPoll {
                                    from,
                                    task_id: update.task_id,
                                })
                                .await;
                        }
                        _ => {}
                    }
                }
            }
        });

        (executor, submitter)
    }

    async fn next_status(node: &mut TestNode) -> TaskStatusUpdate {
        loop {
            match node.events.recv().await.unwrap() {
                PeerEvent::Frame {
                    message: WireMessage::TaskStatus(update),
                    ..
                } => return update,
                _ => continue,
            }
        }
    }

    fn request(task_id: &str, function: &str, args: Vec<Value>) -> TaskRequest {
        TaskRequest {
            task_id: task_id.to_string(),
            function: function.to_string(),
            args,
            kwargs: Map::new(),
            required_cpu: 0.0,
            required_memory: 0.0,
        }
    }

    #[tokio::test]
    async fn test_happy_path_reply() {
        let (executor, mut submitter) = worker_and_submitter().await;
        executor.register_task_handler("square", |args, _| {
            let x = args.first().and_then(Value::as_i64).ok_or("bad arg")?;
            Ok(json!(x * x))
        });

        submitter
            .connections
            .send(
                "worker-host",
                WireMessage::Task(request("task_0", "square", vec![json!(5)])),
            )
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.task_id, "task_0");
        assert_eq!(update.status, Some(TaskStatus::Completed));
        assert_eq!(update.result, Some(json!(25)));
    }

    #[tokio::test]
    async fn test_unknown_function_reply() {
        let (_executor, mut submitter) = worker_and_submitter().await;

        submitter
            .connections
            .send(
                "worker-host",
                WireMessage::Task(request("task_1", "missing", vec![])),
            )
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert!(update.error.unwrap().contains("Unknown function: missing"));
    }

    #[tokio::test]
    async fn test_insufficient_resources_reply() {
        let (executor, mut submitter) = worker_and_submitter().await;
        executor.register_task_handler("noop", |_, _| Ok(Value::Null));

        let mut req = request("task_2", "noop", vec![]);
        req.required_cpu = 101.0;
        submitter
            .connections
            .send("worker-host", WireMessage::Task(req))
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert!(update.error.unwrap().contains("Insufficient resources"));
    }

    #[tokio::test]
    async fn test_handler_error_reply() {
        let (executor, mut submitter) = worker_and_submitter().await;
        executor.register_task_handler("explode", |_, _| Err("boom".to_string()));

        submitter
            .connections
            .send(
                "worker-host",
                WireMessage::Task(request("task_3", "explode", vec![])),
            )
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert_eq!(update.error, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_status_poll_acknowledged() {
        let (_executor, mut submitter) = worker_and_submitter().await;

        submitter
            .connections
            .send(
                "worker-host",
                WireMessage::TaskStatus(TaskStatusUpdate::poll("task_9")),
            )
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.task_id, "task_9");
        assert_eq!(update.status, Some(TaskStatus::Acknowledged));
    }

    #[tokio::test]
    async fn test_kwargs_round_trip() {
        let (executor, mut submitter) = worker_and_submitter().await;
        executor.register_task_handler("combine", |args, kwargs| {
            Ok(json!({ "args": args, "kwargs": kwargs }))
        });

        let mut req = request("task_4", "combine", vec![json!(42), json!("hello")]);
        req.kwargs.insert("y".to_string(), json!("world"));
        submitter
            .connections
            .send("worker-host", WireMessage::Task(req))
            .await
            .unwrap();

        let update = next_status(&mut submitter).await;
        assert_eq!(update.status, Some(TaskStatus::Completed));
        let result = update.result.unwrap();
        assert_eq!(result["args"], json!([42, "hello"]));
        assert_eq!(result["kwargs"]["y"], json!("world"));
    }
}
