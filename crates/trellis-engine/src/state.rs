//! Execution state aggregation.
//!
//! The [`ExecutionStateStore`] is a finite-state aggregator, not an
//! executor: the orchestrator (and, in pooled mode, workers) report node
//! transitions here, and the store maintains per-node and per-execution
//! state, derives aggregate progress, and fans updates out to subscribers.
//!
//! One store instance is shared per process and registered executions are
//! removed by [`cleanup`](ExecutionStateStore::cleanup) once their terminal
//! state has aged out.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::EngineError;
use crate::events::StateEvent;

/// Status of a single node within an execution.
///
/// Transitions run `idle -> pending -> running` and then to exactly one of
/// the terminal states; there is no transition back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
  Idle,
  Pending,
  Running,
  Success,
  Error,
  Skipped,
}

impl NodeStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Success | Self::Error | Self::Skipped)
  }
}

/// Aggregate status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Success,
  Failed,
  Cancelled,
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Success | Self::Failed | Self::Cancelled)
  }
}

/// Live state of one node within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
  pub node_id: String,
  pub node_name: String,
  pub status: NodeStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub progress: Option<f64>,
  /// Assigned on first observation of the node, never changed afterwards.
  pub sequence: u64,
  /// Time of the most recent update to this node.
  pub timestamp: DateTime<Utc>,
}

/// Live state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
  pub execution_id: String,
  pub workflow_id: String,
  pub status: ExecutionStatus,
  pub start_time: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  /// Percentage of nodes in a terminal state, 0-100.
  pub progress: f64,
  pub total_nodes: usize,
  pub completed_nodes: usize,
  pub nodes: HashMap<String, NodeExecutionState>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Optional payload accompanying a node state update.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
  pub input: Option<Value>,
  pub output: Option<Value>,
  pub error: Option<String>,
  pub progress: Option<f64>,
}

impl NodeUpdate {
  pub fn with_input(input: Value) -> Self {
    Self {
      input: Some(input),
      ..Default::default()
    }
  }

  pub fn with_output(output: Value) -> Self {
    Self {
      output: Some(output),
      ..Default::default()
    }
  }

  pub fn with_error(error: impl Into<String>) -> Self {
    Self {
      error: Some(error.into()),
      ..Default::default()
    }
  }
}

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
  id: SubscriptionId,
  sender: mpsc::UnboundedSender<StateEvent>,
}

struct ExecutionEntry {
  state: ExecutionState,
  next_sequence: u64,
}

#[derive(Default)]
struct StoreInner {
  executions: HashMap<String, ExecutionEntry>,
  /// Subscribers keyed by execution id.
  subscribers: HashMap<String, Vec<Subscriber>>,
  next_subscription: u64,
}

impl StoreInner {
  /// Deliver an event to the execution's subscribers, pruning any whose
  /// receiver is gone. Delivery is per-channel, so one stalled or dropped
  /// observer never blocks the others.
  fn emit(&mut self, event: StateEvent) {
    let Some(subs) = self.subscribers.get_mut(event.execution_id()) else {
      return;
    };
    subs.retain(|sub| sub.sender.send(event.clone()).is_ok());
  }

  fn snapshot_event(state: &ExecutionState) -> StateEvent {
    StateEvent::ExecutionSnapshot {
      execution_id: state.execution_id.clone(),
      status: state.status,
      progress: state.progress,
      total_nodes: state.total_nodes,
      completed_nodes: state.completed_nodes,
      start_time: state.start_time,
      duration_ms: state.duration_ms,
    }
  }
}

/// Tracks every live execution in the process.
#[derive(Default)]
pub struct ExecutionStateStore {
  inner: Mutex<StoreInner>,
}

impl ExecutionStateStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a new execution in `pending` state.
  ///
  /// # Errors
  /// Fails with [`EngineError::ExecutionExists`] when the id is already
  /// registered; callers must not silently discard a live run's state.
  pub fn initialize_execution(
    &self,
    execution_id: &str,
    workflow_id: &str,
    total_nodes: usize,
    input: Option<Value>,
  ) -> Result<ExecutionState, EngineError> {
    let mut inner = self.lock();
    if inner.executions.contains_key(execution_id) {
      return Err(EngineError::ExecutionExists {
        execution_id: execution_id.to_string(),
      });
    }

    let state = ExecutionState {
      execution_id: execution_id.to_string(),
      workflow_id: workflow_id.to_string(),
      status: ExecutionStatus::Pending,
      start_time: Utc::now(),
      end_time: None,
      duration_ms: None,
      progress: 0.0,
      total_nodes,
      completed_nodes: 0,
      nodes: HashMap::new(),
      input,
      output: None,
      error: None,
    };

    inner.executions.insert(
      execution_id.to_string(),
      ExecutionEntry {
        state: state.clone(),
        next_sequence: 0,
      },
    );
    inner.emit(StoreInner::snapshot_event(&state));

    info!(
      execution_id = %execution_id,
      workflow_id = %workflow_id,
      total_nodes,
      "execution initialized"
    );
    Ok(state)
  }

  /// Record a node transition and re-derive the aggregate state.
  ///
  /// A node's `sequence` and `start_time` are write-once; updates arriving
  /// after a terminal state overwrite status/output/error for correction
  /// but never re-count toward `completed_nodes` or reset timing.
  pub fn update_node_state(
    &self,
    execution_id: &str,
    node_id: &str,
    node_name: &str,
    status: NodeStatus,
    update: NodeUpdate,
  ) -> Result<NodeExecutionState, EngineError> {
    let mut inner = self.lock();
    let entry =
      inner
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound {
          execution_id: execution_id.to_string(),
        })?;

    let now = Utc::now();
    let ExecutionEntry {
      state,
      next_sequence,
    } = entry;

    let node = state
      .nodes
      .entry(node_id.to_string())
      .or_insert_with(|| {
        let sequence = *next_sequence;
        *next_sequence += 1;
        NodeExecutionState {
          node_id: node_id.to_string(),
          node_name: node_name.to_string(),
          status: NodeStatus::Idle,
          start_time: None,
          end_time: None,
          duration_ms: None,
          input: None,
          output: None,
          error: None,
          progress: None,
          sequence,
          timestamp: now,
        }
      });

    let was_terminal = node.status.is_terminal();

    node.status = status;
    node.timestamp = now;
    if let Some(input) = update.input {
      node.input = Some(input);
    }
    if let Some(output) = update.output {
      node.output = Some(output);
    }
    if let Some(error) = update.error {
      node.error = Some(error);
    }
    if let Some(progress) = update.progress {
      node.progress = Some(progress);
    }

    if status == NodeStatus::Running && node.start_time.is_none() {
      node.start_time = Some(now);
    }
    if status.is_terminal() && !was_terminal {
      node.end_time = Some(now);
      node.duration_ms = node
        .start_time
        .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    let node_snapshot = node.clone();
    let counted = status.is_terminal() && !was_terminal;
    if counted {
      state.completed_nodes += 1;
    }
    if state.total_nodes > 0 {
      state.progress = state.completed_nodes as f64 / state.total_nodes as f64 * 100.0;
    }

    // Aggregate transitions. A terminal execution never resurrects.
    let mut aggregate_changed = counted;
    if !state.status.is_terminal() {
      if status == NodeStatus::Running && state.status == ExecutionStatus::Pending {
        state.status = ExecutionStatus::Running;
        aggregate_changed = true;
      }
      if state.total_nodes > 0 && state.completed_nodes == state.total_nodes {
        let any_error = state
          .nodes
          .values()
          .any(|n| n.status == NodeStatus::Error);
        state.status = if any_error {
          ExecutionStatus::Failed
        } else {
          ExecutionStatus::Success
        };
        state.end_time = Some(now);
        state.duration_ms = Some((now - state.start_time).num_milliseconds().max(0) as u64);
        aggregate_changed = true;
      }
    }

    let node_event = StateEvent::NodeUpdate {
      execution_id: execution_id.to_string(),
      node_id: node_id.to_string(),
      status: node_snapshot.status,
      timestamp: node_snapshot.timestamp,
      duration_ms: node_snapshot.duration_ms,
      progress: node_snapshot.progress,
      error: node_snapshot.error.clone(),
    };
    let snapshot_event = aggregate_changed.then(|| StoreInner::snapshot_event(state));

    inner.emit(node_event);
    if let Some(event) = snapshot_event {
      inner.emit(event);
    }

    Ok(node_snapshot)
  }

  /// Look up an execution's full state.
  pub fn get_execution_state(&self, execution_id: &str) -> Option<ExecutionState> {
    self
      .lock()
      .executions
      .get(execution_id)
      .map(|e| e.state.clone())
  }

  /// Look up one node's state within an execution.
  pub fn get_node_state(&self, execution_id: &str, node_id: &str) -> Option<NodeExecutionState> {
    self
      .lock()
      .executions
      .get(execution_id)
      .and_then(|e| e.state.nodes.get(node_id).cloned())
  }

  /// Subscribe to all subsequent updates of one execution.
  ///
  /// If the execution already exists, one synthetic snapshot is delivered
  /// immediately. The receiver half of the channel is returned; dropping it
  /// effectively unsubscribes on the next delivery.
  pub fn subscribe(
    &self,
    execution_id: &str,
  ) -> (SubscriptionId, mpsc::UnboundedReceiver<StateEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut inner = self.lock();

    if let Some(entry) = inner.executions.get(execution_id) {
      let _ = sender.send(StoreInner::snapshot_event(&entry.state));
    }

    inner.next_subscription += 1;
    let id = SubscriptionId(inner.next_subscription);
    inner
      .subscribers
      .entry(execution_id.to_string())
      .or_default()
      .push(Subscriber { id, sender });

    (id, receiver)
  }

  /// Remove a subscription.
  pub fn unsubscribe(&self, execution_id: &str, id: SubscriptionId) {
    let mut inner = self.lock();
    if let Some(subs) = inner.subscribers.get_mut(execution_id) {
      subs.retain(|sub| sub.id != id);
      if subs.is_empty() {
        inner.subscribers.remove(execution_id);
      }
    }
  }

  /// Record the execution's final output.
  pub fn set_execution_output(&self, execution_id: &str, output: Value) -> Result<(), EngineError> {
    let mut inner = self.lock();
    let entry =
      inner
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound {
          execution_id: execution_id.to_string(),
        })?;
    entry.state.output = Some(output);
    Ok(())
  }

  /// Mark the execution failed with a run-level error.
  ///
  /// Authoritative finalization: overrides a derived terminal state, except
  /// an explicit cancellation.
  pub fn set_execution_error(
    &self,
    execution_id: &str,
    error: impl Into<String>,
  ) -> Result<(), EngineError> {
    let mut inner = self.lock();
    let entry =
      inner
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound {
          execution_id: execution_id.to_string(),
        })?;

    let state = &mut entry.state;
    state.error = Some(error.into());
    if state.status != ExecutionStatus::Cancelled {
      state.status = ExecutionStatus::Failed;
    }
    let now = Utc::now();
    if state.end_time.is_none() {
      state.end_time = Some(now);
      state.duration_ms = Some((now - state.start_time).num_milliseconds().max(0) as u64);
    }

    let snapshot = StoreInner::snapshot_event(state);
    inner.emit(snapshot);
    Ok(())
  }

  /// Cancel a running execution.
  ///
  /// Returns `true` when the execution transitioned to `cancelled`;
  /// `false` when it was not in a cancellable state. Cancellation does not
  /// preempt in-flight node work, it only settles the aggregate status.
  pub fn cancel_execution(&self, execution_id: &str) -> Result<bool, EngineError> {
    let mut inner = self.lock();
    let entry =
      inner
        .executions
        .get_mut(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound {
          execution_id: execution_id.to_string(),
        })?;

    let state = &mut entry.state;
    if state.status != ExecutionStatus::Running && state.status != ExecutionStatus::Pending {
      return Ok(false);
    }

    let now = Utc::now();
    state.status = ExecutionStatus::Cancelled;
    state.end_time = Some(now);
    state.duration_ms = Some((now - state.start_time).num_milliseconds().max(0) as u64);

    info!(execution_id = %execution_id, "execution cancelled");
    let snapshot = StoreInner::snapshot_event(state);
    inner.emit(snapshot);
    Ok(true)
  }

  /// Drop executions whose terminal state is older than `max_age`.
  ///
  /// Invoked by process-wide lifecycle management, not the orchestrator.
  /// Returns the number of executions removed.
  pub fn cleanup(&self, max_age: Duration) -> usize {
    let mut inner = self.lock();
    let cutoff = Utc::now() - max_age;
    let stale: Vec<String> = inner
      .executions
      .iter()
      .filter(|(_, e)| {
        e.state.status.is_terminal() && e.state.end_time.is_some_and(|end| end < cutoff)
      })
      .map(|(id, _)| id.clone())
      .collect();

    for id in &stale {
      inner.executions.remove(id);
      inner.subscribers.remove(id);
    }
    if !stale.is_empty() {
      info!(removed = stale.len(), "cleaned up aged executions");
    }
    stale.len()
  }

  /// Number of executions currently tracked.
  pub fn len(&self) -> usize {
    self.lock().executions.len()
  }

  /// True when no execution is tracked.
  pub fn is_empty(&self) -> bool {
    self.lock().executions.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store_with_execution(total: usize) -> ExecutionStateStore {
    let store = ExecutionStateStore::new();
    store
      .initialize_execution("exec-1", "wf-1", total, Some(json!({ "seed": 1 })))
      .unwrap();
    store
  }

  #[test]
  fn test_duplicate_initialize_fails() {
    let store = store_with_execution(2);
    let err = store
      .initialize_execution("exec-1", "wf-1", 2, None)
      .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionExists { .. }));
  }

  #[test]
  fn test_update_unknown_execution_fails() {
    let store = ExecutionStateStore::new();
    let err = store
      .update_node_state("nope", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotFound { .. }));
  }

  #[test]
  fn test_sequence_is_stable_per_node() {
    let store = store_with_execution(2);
    let a = store
      .update_node_state("exec-1", "a", "A", NodeStatus::Pending, NodeUpdate::default())
      .unwrap();
    let b = store
      .update_node_state("exec-1", "b", "B", NodeStatus::Pending, NodeUpdate::default())
      .unwrap();
    let a_again = store
      .update_node_state("exec-1", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap();

    assert_eq!(a.sequence, 0);
    assert_eq!(b.sequence, 1);
    assert_eq!(a_again.sequence, 0);
  }

  #[test]
  fn test_running_sets_start_time_once() {
    let store = store_with_execution(1);
    let first = store
      .update_node_state("exec-1", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap();
    let start = first.start_time.unwrap();

    let again = store
      .update_node_state("exec-1", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap();
    assert_eq!(again.start_time, Some(start));
  }

  #[test]
  fn test_completion_aggregates_success() {
    let store = store_with_execution(2);
    store
      .update_node_state("exec-1", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap();
    assert_eq!(
      store.get_execution_state("exec-1").unwrap().status,
      ExecutionStatus::Running
    );

    store
      .update_node_state(
        "exec-1",
        "a",
        "A",
        NodeStatus::Success,
        NodeUpdate::with_output(json!(1)),
      )
      .unwrap();
    let mid = store.get_execution_state("exec-1").unwrap();
    assert_eq!(mid.completed_nodes, 1);
    assert_eq!(mid.status, ExecutionStatus::Running);
    assert!((mid.progress - 50.0).abs() < f64::EPSILON);

    store
      .update_node_state(
        "exec-1",
        "b",
        "B",
        NodeStatus::Success,
        NodeUpdate::with_output(json!(2)),
      )
      .unwrap();
    let done = store.get_execution_state("exec-1").unwrap();
    assert_eq!(done.status, ExecutionStatus::Success);
    assert_eq!(done.completed_nodes, 2);
    assert!(done.end_time.is_some());
  }

  #[test]
  fn test_any_error_makes_execution_failed() {
    let store = store_with_execution(2);
    store
      .update_node_state(
        "exec-1",
        "a",
        "A",
        NodeStatus::Error,
        NodeUpdate::with_error("boom"),
      )
      .unwrap();
    store
      .update_node_state("exec-1", "b", "B", NodeStatus::Success, NodeUpdate::default())
      .unwrap();

    assert_eq!(
      store.get_execution_state("exec-1").unwrap().status,
      ExecutionStatus::Failed
    );
  }

  #[test]
  fn test_terminal_correction_does_not_recount() {
    let store = store_with_execution(2);
    store
      .update_node_state("exec-1", "a", "A", NodeStatus::Success, NodeUpdate::default())
      .unwrap();
    // Correction overwrite: status flips, count stays.
    let corrected = store
      .update_node_state(
        "exec-1",
        "a",
        "A",
        NodeStatus::Error,
        NodeUpdate::with_error("late failure"),
      )
      .unwrap();

    assert_eq!(corrected.status, NodeStatus::Error);
    let state = store.get_execution_state("exec-1").unwrap();
    assert_eq!(state.completed_nodes, 1);
    assert_eq!(state.status, ExecutionStatus::Running);
  }

  #[test]
  fn test_cancel_only_while_active() {
    let store = store_with_execution(1);
    assert!(store.cancel_execution("exec-1").unwrap());
    // Already cancelled; a second cancel is a no-op.
    assert!(!store.cancel_execution("exec-1").unwrap());
    assert_eq!(
      store.get_execution_state("exec-1").unwrap().status,
      ExecutionStatus::Cancelled
    );
  }

  #[tokio::test]
  async fn test_subscribe_delivers_synthetic_snapshot_then_updates() {
    let store = store_with_execution(1);
    let (_id, mut rx) = store.subscribe("exec-1");

    match rx.recv().await.unwrap() {
      StateEvent::ExecutionSnapshot { execution_id, .. } => assert_eq!(execution_id, "exec-1"),
      other => panic!("expected snapshot, got {other:?}"),
    }

    store
      .update_node_state("exec-1", "a", "A", NodeStatus::Running, NodeUpdate::default())
      .unwrap();
    match rx.recv().await.unwrap() {
      StateEvent::NodeUpdate { node_id, status, .. } => {
        assert_eq!(node_id, "a");
        assert_eq!(status, NodeStatus::Running);
      }
      other => panic!("expected node update, got {other:?}"),
    }
  }

  #[test]
  fn test_dropped_subscriber_does_not_block_updates() {
    let store = store_with_execution(1);
    let (_id, rx) = store.subscribe("exec-1");
    drop(rx);

    // Delivery prunes the dead channel and continues.
    store
      .update_node_state("exec-1", "a", "A", NodeStatus::Success, NodeUpdate::default())
      .unwrap();
    assert_eq!(
      store.get_execution_state("exec-1").unwrap().status,
      ExecutionStatus::Success
    );
  }

  #[test]
  fn test_cleanup_removes_only_aged_terminal() {
    let store = ExecutionStateStore::new();
    store
      .initialize_execution("done", "wf", 1, None)
      .unwrap();
    store
      .update_node_state("done", "a", "A", NodeStatus::Success, NodeUpdate::default())
      .unwrap();
    store
      .initialize_execution("live", "wf", 1, None)
      .unwrap();

    // Nothing is older than an hour yet.
    assert_eq!(store.cleanup(Duration::hours(1)), 0);
    // With a zero max-age the terminal execution goes, the live one stays.
    assert_eq!(store.cleanup(Duration::zero()), 1);
    assert!(store.get_execution_state("done").is_none());
    assert!(store.get_execution_state("live").is_some());
  }
}
