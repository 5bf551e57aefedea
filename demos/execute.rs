//! End-to-end demo: run one node, register a handler, and submit a task.
//!
//! Start this on two machines on the same subnet (or twice on one machine
//! with distinct `TASKMESH_HOSTNAME` values). Each instance serves `square`
//! and `combine` to its peers and submits a few tasks of its own once
//! discovery has had a chance to find someone.

use std::time::Duration;

use serde_json::{json, Map, Value};
use taskmesh::{Node, NodeConfig};

#[tokio::main]
async fn main() -> taskmesh::Result<()> {
    taskmesh::logging::init_simple(tracing::Level::INFO)?;

    let config = NodeConfig::load(None)?;
    let node = Node::new(config);

    node.register_task_handler("square", |args, _kwargs| {
        let x = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("square expects one integer argument")?;
        Ok(json!(x * x))
    });
    node.register_task_handler("combine", |args, kwargs| {
        let x = args.first().cloned().unwrap_or(Value::Null);
        let y = kwargs.get("y").cloned().unwrap_or(Value::Null);
        Ok(json!(format!("Number: {x}, String: {y}")))
    });

    node.start().await?;

    // Give discovery a moment to find peers before submitting.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let task_id = node
        .submit_task("square", vec![json!(5)], Map::new(), 10.0, 20.0)
        .await;
    println!("Submitted {task_id}");

    let mut kwargs = Map::new();
    kwargs.insert("y".to_string(), json!("world"));
    let task_id2 = node
        .submit_task("combine", vec![json!(42)], kwargs, 0.0, 0.0)
        .await;
    println!("Submitted {task_id2}");

    // Report task states once a second until interrupted.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                for (id, view) in node.scheduler().get_all_tasks() {
                    println!(
                        "{id}: {} result={:?} peer={:?}",
                        view.status, view.result, view.assigned_peer
                    );
                }
            }
        }
    }

    node.stop();
    Ok(())
}
