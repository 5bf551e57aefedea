//! Two-node integration tests
//!
//! Runs pairs of full nodes in one process over loopback. The TCP servers
//! bind OS-assigned ports and the dial side targets the bound address
//! directly, so the tests are hermetic; UDP discovery gets a distinct port
//! per test to avoid crosstalk.

use std::time::Duration;

use serde_json::{json, Map, Value};
use taskmesh::scheduler::{TaskState, TaskView};
use taskmesh::{Node, NodeConfig};

/// Build a test node config: ephemeral TCP port, no auto-connect
fn node_config(hostname: &str, discovery_port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.hostname = Some(hostname.to_string());
    config.discovery.port = discovery_port;
    config.network.peer_port = 0;
    config.network.auto_connect = false;
    config.scheduler.task_timeout_secs = 60;
    config
}

/// Start a worker/submitter pair and link them
async fn linked_pair(
    worker_host: &str,
    submitter_host: &str,
    discovery_base: u16,
) -> (Node, Node) {
    let worker = Node::new(node_config(worker_host, discovery_base));
    let worker_addr = worker.start().await.unwrap();

    let submitter = Node::new(node_config(submitter_host, discovery_base + 1));
    submitter.start().await.unwrap();

    let connected = submitter
        .connections()
        .connect_to_addr(worker_host, worker_addr)
        .await;
    assert!(connected, "submitter failed to dial the worker");

    (worker, submitter)
}

/// Poll a task until its status satisfies the predicate
async fn wait_for<F>(node: &Node, task_id: &str, deadline: Duration, pred: F) -> TaskView
where
    F: Fn(&TaskView) -> bool,
{
    let start = std::time::Instant::now();
    loop {
        let view = node
            .scheduler()
            .get_task_status(task_id)
            .expect("task record missing");
        if pred(&view) {
            return view;
        }
        if start.elapsed() > deadline {
            panic!(
                "task {task_id} never reached the expected state; last = {:?}",
                view.status
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_handshake_populates_both_peer_tables() {
    let (worker, submitter) = linked_pair("alpha", "beta", 53110).await;

    let submitter_view = submitter.connections().get_connected_nodes();
    let worker_record = submitter_view.get("alpha").expect("worker not in table");
    assert!(worker_record.active);
    assert!(worker_record.hardware.cpu_count > 0);
    assert_eq!(worker_record.hardware.hostname, "alpha");

    // The worker keyed the inbound link by the submitter's handshake hostname
    let mut seen = false;
    for _ in 0..50 {
        if worker.connections().get_connected_nodes().contains_key("beta") {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(seen, "worker never recorded the submitter");

    submitter.stop();
    worker.stop();
}

#[tokio::test]
async fn test_happy_path_task() {
    let (worker, submitter) = linked_pair("gamma", "delta", 53120).await;

    worker.register_task_handler("square", |args, _kwargs| {
        let x = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("square expects one integer argument")?;
        Ok(json!(x * x))
    });

    let task_id = submitter
        .submit_task("square", vec![json!(5)], Map::new(), 0.0, 0.0)
        .await;
    assert_eq!(task_id, "task_0");

    let view = wait_for(&submitter, &task_id, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;

    assert_eq!(view.status, TaskState::Completed);
    assert_eq!(view.result, Some(json!(25)));
    assert_eq!(view.assigned_peer.as_deref(), Some("gamma"));

    submitter.stop();
    worker.stop();
}

#[tokio::test]
async fn test_unknown_handler_fails_task() {
    let (worker, submitter) = linked_pair("epsilon", "zeta", 53130).await;

    let task_id = submitter
        .submit_task("square", vec![json!(5)], Map::new(), 0.0, 0.0)
        .await;

    let view = wait_for(&submitter, &task_id, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;

    assert_eq!(view.status, TaskState::Failed);
    assert!(view.error.unwrap().contains("Unknown function"));

    submitter.stop();
    worker.stop();
}

#[tokio::test]
async fn test_args_and_kwargs_round_trip() {
    let (worker, submitter) = linked_pair("eta", "theta", 53140).await;

    worker.register_task_handler("combine", |args, kwargs| {
        Ok(json!({ "args": args, "kwargs": kwargs }))
    });

    let mut kwargs = Map::new();
    kwargs.insert("y".to_string(), json!("world"));
    let task_id = submitter
        .submit_task(
            "combine",
            vec![json!(42), json!("hello")],
            kwargs,
            0.0,
            0.0,
        )
        .await;

    let view = wait_for(&submitter, &task_id, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;

    assert_eq!(view.status, TaskState::Completed);
    let result = view.result.unwrap();
    assert_eq!(result["args"], json!([42, "hello"]));
    assert_eq!(result["kwargs"], json!({"y": "world"}));

    submitter.stop();
    worker.stop();
}

#[tokio::test]
async fn test_over_capacity_submission_stays_pending() {
    let (worker, submitter) = linked_pair("iota", "kappa", 53150).await;

    let task_id = submitter
        .submit_task("square", vec![json!(5)], Map::new(), 101.0, 0.0)
        .await;

    // No peer can ever satisfy the request; the task is not re-examined
    tokio::time::sleep(Duration::from_secs(1)).await;
    let view = submitter.scheduler().get_task_status(&task_id).unwrap();
    assert_eq!(view.status, TaskState::Pending);
    assert!(view.assigned_peer.is_none());

    submitter.stop();
    worker.stop();
}

#[tokio::test]
async fn test_peer_death_fails_running_task() {
    let (worker, submitter) = linked_pair("lambda", "mu", 53160).await;

    worker.register_task_handler("sleepy", |_args, _kwargs| {
        std::thread::sleep(Duration::from_secs(5));
        Ok(Value::Null)
    });

    let task_id = submitter
        .submit_task("sleepy", vec![], Map::new(), 0.0, 0.0)
        .await;

    let view = submitter.scheduler().get_task_status(&task_id).unwrap();
    assert_eq!(view.status, TaskState::Running);

    // Kill the worker mid-task; the submitter's link drops and the task
    // transitions to failed.
    worker.stop();

    let view = wait_for(&submitter, &task_id, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;
    assert_eq!(view.status, TaskState::Failed);

    // The dead peer is gone from the table
    assert!(!submitter.connections().get_connected_nodes().contains_key("lambda"));

    submitter.stop();
}

#[tokio::test]
async fn test_task_history_is_retained() {
    let (worker, submitter) = linked_pair("nu", "xi", 53170).await;

    worker.register_task_handler("one", |_, _| Ok(json!(1)));

    let first = submitter
        .submit_task("one", vec![], Map::new(), 0.0, 0.0)
        .await;
    wait_for(&submitter, &first, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;

    let second = submitter
        .submit_task("one", vec![], Map::new(), 0.0, 0.0)
        .await;
    wait_for(&submitter, &second, Duration::from_secs(20), |v| {
        v.status.is_terminal()
    })
    .await;

    let all = submitter.scheduler().get_all_tasks();
    assert_eq!(all.len(), 2);
    assert!(all.contains_key(&first));
    assert!(all.contains_key(&second));
    assert_eq!(all[&first].status, TaskState::Completed);

    submitter.stop();
    worker.stop();
}
