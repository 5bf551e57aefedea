//! Node composition
//!
//! Wires the four services — discovery, connection manager, executor,
//! scheduler — as explicit dependencies, runs the inbound frame router, and
//! optionally dials discovered peers in the background. One `Node` per
//! process is the expected shape, but nothing here is global except the
//! handler registry the caller chooses to share.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::discovery::DiscoveryService;
use crate::error::Result;
use crate::executor::{ExecutorRequest, HandlerRegistry, HandlerResult, TaskExecutor};
use crate::hardware::HardwareProbe;
use crate::peer::{ConnectionManager, PeerEvent, PeerTable};
use crate::protocol::WireMessage;
use crate::scheduler::TaskScheduler;

/// One taskmesh process: submitter, scheduler, and worker at once
pub struct Node {
    config: NodeConfig,
    hostname: String,
    probe: Arc<HardwareProbe>,
    discovery: Arc<DiscoveryService>,
    connections: Arc<ConnectionManager>,
    executor: Arc<TaskExecutor>,
    scheduler: Arc<TaskScheduler>,
    event_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Node {
    /// Build a node from configuration, sharing the given handler registry
    pub fn with_registry(config: NodeConfig, registry: Arc<HandlerRegistry>) -> Self {
        let hostname = config.hostname();
        let probe = Arc::new(HardwareProbe::new(hostname.clone()));
        let table = Arc::new(PeerTable::new());
        let (event_tx, event_rx) = mpsc::channel(256);

        let connections = Arc::new(ConnectionManager::new(
            config.connection_config(),
            Arc::clone(&probe),
            table,
            event_tx,
        ));
        let discovery = Arc::new(DiscoveryService::new(
            config.discovery_config(),
            hostname.clone(),
        ));
        let executor = Arc::new(TaskExecutor::new(
            registry,
            Arc::clone(&probe),
            Arc::clone(&connections),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler_config(),
            Arc::clone(&connections),
        ));

        Self {
            config,
            hostname,
            probe,
            discovery,
            connections,
            executor,
            scheduler,
            event_rx: Mutex::new(Some(event_rx)),
            cancel: Mutex::new(None),
        }
    }

    /// Build a node with its own private handler registry
    pub fn new(config: NodeConfig) -> Self {
        Self::with_registry(config, Arc::new(HandlerRegistry::new()))
    }

    /// Bring the node up: discovery, TCP server, executor, frame router,
    /// and the auto-connect pass. Returns the bound peer address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.cancel.lock().is_some() {
            if let Some(addr) = self.connections.listener_addr() {
                return Ok(addr);
            }
        }

        let addr = self.connections.start_server().await?;
        self.discovery.start()?;
        self.executor.start();

        let token = CancellationToken::new();

        if let Some(event_rx) = self.event_rx.lock().take() {
            let scheduler = Arc::clone(&self.scheduler);
            let executor_inbound = self.executor.inbound();
            let route_token = token.clone();
            tokio::spawn(async move {
                route_events(event_rx, scheduler, executor_inbound, route_token).await;
            });
        }

        if self.config.network.auto_connect {
            let discovery = Arc::clone(&self.discovery);
            let connections = Arc::clone(&self.connections);
            let hostname = self.hostname.clone();
            let interval =
                Duration::from_secs(self.config.network.auto_connect_interval_secs.max(1));
            let dial_token = token.clone();
            tokio::spawn(async move {
                auto_connect_loop(discovery, connections, hostname, interval, dial_token).await;
            });
        }

        *self.cancel.lock() = Some(token);
        info!(hostname = %self.hostname, addr = %addr, "Node started");
        Ok(addr)
    }

    /// Tear the node down in reverse order of startup
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.discovery.stop();
        self.executor.stop();
        self.connections.stop();
        info!(hostname = %self.hostname, "Node stopped");
    }

    /// Register a function that peers may invoke on this node
    pub fn register_task_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.executor.register_task_handler(name, handler);
    }

    /// Submit a task for distributed execution
    pub async fn submit_task(
        &self,
        function: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        required_cpu: f32,
        required_memory: f32,
    ) -> String {
        self.scheduler
            .submit_task(function, args, kwargs, required_cpu, required_memory)
            .await
    }

    /// The hostname this node announces and handshakes under
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The hardware probe
    pub fn probe(&self) -> &Arc<HardwareProbe> {
        &self.probe
    }

    /// The discovery service
    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// The connection manager
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The task executor
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// The task scheduler
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }
}

/// Background task: route inbound link events to the executor and scheduler
async fn route_events(
    mut event_rx: mpsc::Receiver<PeerEvent>,
    scheduler: Arc<TaskScheduler>,
    executor_inbound: mpsc::Sender<ExecutorRequest>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            PeerEvent::Connected { hostname } => {
                debug!(peer = %hostname, "Peer link up");
            }
            PeerEvent::Disconnected { hostname, reason } => {
                debug!(peer = %hostname, reason = %reason, "Peer link down");
                scheduler.peer_lost(&hostname);
            }
            PeerEvent::Frame { from, message } => match message {
                WireMessage::Task(request) => {
                    let _ = executor_inbound
                        .send(ExecutorRequest::Task { from, request })
                        .await;
                }
                WireMessage::TaskStatus(update) if update.is_terminal() => {
                    scheduler.handle_status(update);
                }
                WireMessage::TaskStatus(update) if update.status.is_none() => {
                    let _ = executor_inbound
                        .send(ExecutorRequest::StatusPoll {
                            from,
                            task_id: update.task_id,
                        })
                        .await;
                }
                WireMessage::TaskStatus(update) => {
                    // Acknowledgement stubs and other non-terminal reports
                    // carry nothing the tables need.
                    debug!(task_id = %update.task_id, status = ?update.status, "Dropping stray status");
                }
                WireMessage::Handshake(_) => {
                    // Telemetry refreshes are consumed by the link reader
                    // before events are emitted.
                }
            },
        }
    }
    debug!("Event router stopped");
}

/// Background task: periodically dial discovered peers we are not yet
/// connected to
async fn auto_connect_loop(
    discovery: Arc<DiscoveryService>,
    connections: Arc<ConnectionManager>,
    local_hostname: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                for (hostname, ip) in discovery.get_nodes() {
                    if hostname == local_hostname {
                        continue;
                    }
                    if connections.table().is_connected(&hostname) {
                        continue;
                    }
                    connections.connect_to_node(&hostname, ip).await;
                }
            }
        }
    }
    debug!("Auto-connect loop stopped");
}
