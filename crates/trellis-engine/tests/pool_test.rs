//! Dispatch pool integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use trellis_engine::{
  DispatchPool, EngineConfig, EngineError, ExecutionStateStore, ExecutionStatus, NodeExecutor,
  Orchestrator, OutputsView, RunOptions, WorkerTask,
};
use trellis_workflow::{Edge, Node, NodeConfig, Workflow};

const GRACE: Duration = Duration::from_secs(5);

/// Executor whose behavior is keyed by node type: `block` waits for a
/// permit, `fail` returns an error, `panic` panics, `slow` sleeps briefly,
/// anything else completes immediately. Records execution order and the
/// high-water mark of concurrent executions.
struct ProbeExecutor {
  order: Mutex<Vec<String>>,
  gate: Semaphore,
  current: AtomicUsize,
  max_concurrent: AtomicUsize,
}

impl ProbeExecutor {
  fn new() -> Self {
    Self {
      order: Mutex::new(Vec::new()),
      gate: Semaphore::new(0),
      current: AtomicUsize::new(0),
      max_concurrent: AtomicUsize::new(0),
    }
  }

  fn executed(&self) -> Vec<String> {
    self.order.lock().unwrap().clone()
  }

  fn release(&self, permits: usize) {
    self.gate.add_permits(permits);
  }
}

#[async_trait]
impl NodeExecutor for ProbeExecutor {
  async fn execute(
    &self,
    node: &Node,
    _input: Value,
    _outputs: &dyn OutputsView,
  ) -> Result<Value, EngineError> {
    self.order.lock().unwrap().push(node.id.clone());
    let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_concurrent.fetch_max(running, Ordering::SeqCst);

    let result = match node.node_type.as_str() {
      "block" => {
        let _permit = self.gate.acquire().await;
        Ok(json!({ "node": node.id }))
      }
      "fail" => Err(EngineError::NodeExecution {
        node_id: node.id.clone(),
        message: "probe failure".to_string(),
      }),
      "panic" => panic!("probe panic"),
      "slow" => {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!({ "node": node.id }))
      }
      _ => Ok(json!({ "node": node.id })),
    };

    self.current.fetch_sub(1, Ordering::SeqCst);
    result
  }
}

fn task(id: &str, node_type: &str, priority: i32) -> WorkerTask {
  WorkerTask {
    id: id.to_string(),
    execution_id: "exec-pool".to_string(),
    node_id: id.to_string(),
    node: Node {
      id: id.to_string(),
      node_type: node_type.to_string(),
      config: NodeConfig::default(),
    },
    input: json!({}),
    outputs_snapshot: HashMap::new(),
    priority,
  }
}

#[tokio::test]
async fn test_queue_drains_by_priority_with_fifo_ties() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 1, GRACE).unwrap();

  // The plug occupies the only worker; everything after it queues.
  let plug = pool.submit(task("plug", "block", 100)).unwrap();
  let handles = vec![
    pool.submit(task("low", "fast", 1)).unwrap(),
    pool.submit(task("high-a", "fast", 5)).unwrap(),
    pool.submit(task("high-b", "fast", 5)).unwrap(),
    pool.submit(task("mid", "fast", 3)).unwrap(),
  ];

  executor.release(1);
  plug.wait().await.unwrap();
  for handle in handles {
    handle.wait().await.unwrap();
  }

  assert_eq!(
    executor.executed(),
    vec!["plug", "high-a", "high-b", "mid", "low"]
  );
}

#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 2, GRACE).unwrap();

  let handles: Vec<_> = (0..6)
    .map(|i| pool.submit(task(&format!("t{i}"), "slow", 0)).unwrap())
    .collect();
  for handle in handles {
    handle.wait().await.unwrap();
  }

  assert!(executor.max_concurrent.load(Ordering::SeqCst) <= 2);
  let metrics = pool.metrics();
  assert_eq!(metrics.total_tasks, 6);
  assert_eq!(metrics.completed_tasks, 6);
  assert_eq!(metrics.queue_length, 0);
  assert!(metrics.average_execution_time >= Duration::from_millis(20));
}

#[tokio::test]
async fn test_task_failure_does_not_kill_worker() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 1, GRACE).unwrap();

  let err = pool.submit(task("bad", "fail", 0)).unwrap().wait().await.unwrap_err();
  assert!(matches!(err, EngineError::NodeExecution { .. }));

  // The same worker keeps serving.
  pool.submit(task("good", "fast", 0)).unwrap().wait().await.unwrap();

  let metrics = pool.metrics();
  assert_eq!(metrics.failed_tasks, 1);
  assert_eq!(metrics.completed_tasks, 1);
  assert_eq!(metrics.active_workers, 1);
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 1, GRACE).unwrap();

  // The panic kills the worker; the submitter sees abandonment.
  let err = pool
    .submit(task("boom", "panic", 0))
    .unwrap()
    .wait()
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::Dispatch { .. }));

  // Replacement arrives after the respawn delay and serves new work.
  tokio::time::sleep(Duration::from_millis(800)).await;
  assert_eq!(pool.metrics().active_workers, 1);
  pool.submit(task("after", "fast", 0)).unwrap().wait().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_refuses_new_work() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 1, GRACE).unwrap();

  pool.submit(task("done", "fast", 0)).unwrap().wait().await.unwrap();
  pool.shutdown().await;

  let err = pool.submit(task("late", "fast", 0)).unwrap_err();
  assert!(matches!(err, EngineError::Dispatch { .. }));
}

#[tokio::test]
async fn test_run_pooled_executes_diamond() {
  let executor = Arc::new(ProbeExecutor::new());
  let pool = DispatchPool::new(executor.clone(), 2, GRACE).unwrap();
  let state = Arc::new(ExecutionStateStore::new());
  let orch = Orchestrator::new(state.clone(), executor.clone(), EngineConfig::default()).unwrap();

  let node = |id: &str| Node {
    id: id.to_string(),
    node_type: "slow".to_string(),
    config: NodeConfig::default(),
  };
  let edge = |id: &str, source: &str, target: &str, handle: Option<&str>| Edge {
    id: id.to_string(),
    source: source.to_string(),
    target: target.to_string(),
    source_handle: None,
    target_handle: handle.map(|h| h.to_string()),
  };
  let wf = Workflow {
    workflow_id: "wf-diamond".to_string(),
    name: "diamond".to_string(),
    nodes: vec![node("a"), node("b"), node("c"), node("d")],
    edges: vec![
      edge("e1", "a", "b", None),
      edge("e2", "a", "c", None),
      edge("e3", "b", "d", Some("left")),
      edge("e4", "c", "d", Some("right")),
    ],
  };

  let result = orch
    .run_pooled(&wf, json!({ "seed": 1 }), &pool, RunOptions::default())
    .await
    .unwrap();

  assert_eq!(result.status, ExecutionStatus::Success);
  assert_eq!(result.logs.len(), 4);
  // "d" saw both upstream outputs keyed by handle.
  let d_log = result.logs.iter().find(|l| l.node_id == "d").unwrap();
  assert_eq!(
    d_log.input,
    Some(json!({ "left": { "node": "b" }, "right": { "node": "c" } }))
  );

  let exec = state.get_execution_state(&result.execution_id).unwrap();
  assert_eq!(exec.status, ExecutionStatus::Success);
  assert_eq!(exec.completed_nodes, 4);
  pool.shutdown().await;
}
