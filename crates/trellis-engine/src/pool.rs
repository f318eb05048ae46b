//! Dispatch pool.
//!
//! Bounds concurrent node execution to a fixed worker count. Excess tasks
//! wait in a priority queue (higher priority first, ties in submission
//! order). Workers are tokio tasks fed over per-worker channels; a worker
//! that dies (panicking executor, aborted task) is detected through a drop
//! guard and replaced after a short delay.
//!
//! The queue and the worker-availability set live behind one mutex - the
//! single point of mutual exclusion - so a task is never double-dispatched
//! and a worker never double-booked. Task-level failures are reported to
//! the submitter through the task's handle; they neither kill the worker
//! nor get retried here.
//!
//! One pool instance is shared process-wide across concurrently running
//! executions, so queue ordering governs fairness across executions too.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_workflow::Node;

use crate::error::EngineError;
use crate::executor::{NodeExecutor, OutputsSnapshot};

/// Delay before a crashed worker is replaced.
const RESPAWN_DELAY: Duration = Duration::from_millis(500);
/// Rolling window of task durations kept for the moving average.
const DURATION_WINDOW: usize = 100;

/// One node invocation submitted to the pool. Immutable after submission.
#[derive(Debug, Clone)]
pub struct WorkerTask {
  pub id: String,
  pub execution_id: String,
  pub node_id: String,
  pub node: Node,
  pub input: Value,
  /// Outputs visible at submission time.
  pub outputs_snapshot: HashMap<String, Value>,
  pub priority: i32,
}

/// Handle resolving to a submitted task's result.
#[derive(Debug)]
pub struct TaskHandle {
  task_id: String,
  receiver: oneshot::Receiver<Result<Value, EngineError>>,
}

impl TaskHandle {
  /// Wait for the task to complete.
  pub async fn wait(self) -> Result<Value, EngineError> {
    match self.receiver.await {
      Ok(result) => result,
      // The responder was dropped: worker crash or pool shutdown.
      Err(_) => Err(EngineError::Dispatch {
        task_id: self.task_id,
        message: "task abandoned before completion".to_string(),
      }),
    }
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }
}

/// Point-in-time pool metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetrics {
  pub total_tasks: u64,
  pub completed_tasks: u64,
  pub failed_tasks: u64,
  pub average_execution_time: Duration,
  pub active_workers: usize,
  pub queue_length: usize,
}

type TaskResponder = oneshot::Sender<Result<Value, EngineError>>;

struct QueuedTask {
  task: WorkerTask,
  responder: TaskResponder,
  seq: u64,
}

impl PartialEq for QueuedTask {
  fn eq(&self, other: &Self) -> bool {
    self.task.priority == other.task.priority && self.seq == other.seq
  }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedTask {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Max-heap: higher priority first, then lower sequence (FIFO on ties).
    self
      .task
      .priority
      .cmp(&other.task.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

/// Reports flowing from workers to the supervisor.
///
/// Per-node progress is not part of this protocol: the executor capability
/// reports no mid-task progress, so progress flows through the state
/// store's node updates instead.
enum WorkerReport {
  Ready { worker_id: u64 },
  Started { worker_id: u64, task_id: String },
  Completed { worker_id: u64, task_id: String },
  Failed { worker_id: u64, task_id: String },
  /// Sent from a drop guard, so it also fires when the worker panics.
  Exited { worker_id: u64 },
  /// Internal timer signal requesting a replacement worker.
  RespawnDue,
}

struct WorkerHandle {
  sender: mpsc::UnboundedSender<(WorkerTask, TaskResponder)>,
  join: JoinHandle<()>,
}

struct InFlight {
  worker_id: u64,
  started: Instant,
}

struct PoolInner {
  queue: BinaryHeap<QueuedTask>,
  idle: Vec<u64>,
  workers: HashMap<u64, WorkerHandle>,
  in_flight: HashMap<String, InFlight>,
  durations: VecDeque<Duration>,
  total_tasks: u64,
  completed_tasks: u64,
  failed_tasks: u64,
  next_seq: u64,
  next_worker_id: u64,
  accepting: bool,
}

impl PoolInner {
  /// Dispatch queued tasks while both a task and an idle worker exist.
  fn dispatch(&mut self) {
    loop {
      if self.queue.is_empty() || self.idle.is_empty() {
        break;
      }
      let Some(queued) = self.queue.pop() else {
        break;
      };
      let Some(worker_id) = self.idle.pop() else {
        self.queue.push(queued);
        break;
      };

      let Some(worker) = self.workers.get(&worker_id) else {
        // Worker vanished between going idle and being picked; put the
        // task back and try the next candidate.
        self.queue.push(queued);
        continue;
      };

      let task_id = queued.task.id.clone();
      self.in_flight.insert(
        task_id.clone(),
        InFlight {
          worker_id,
          started: Instant::now(),
        },
      );
      debug!(
        task_id = %task_id,
        node_id = %queued.task.node_id,
        worker_id,
        "task dispatched"
      );
      if worker.sender.send((queued.task, queued.responder)).is_err() {
        // Channel closed: the worker is gone. The Exited report removes
        // the worker itself; only the fresh booking is rolled back here.
        self.in_flight.remove(&task_id);
      }
    }
  }

  fn record_finished(&mut self, task_id: &str, failed: bool) {
    if let Some(flight) = self.in_flight.remove(task_id) {
      let elapsed = flight.started.elapsed();
      if self.durations.len() == DURATION_WINDOW {
        self.durations.pop_front();
      }
      self.durations.push_back(elapsed);
    }
    if failed {
      self.failed_tasks += 1;
    } else {
      self.completed_tasks += 1;
    }
  }

  fn average_execution_time(&self) -> Duration {
    if self.durations.is_empty() {
      return Duration::ZERO;
    }
    let total: Duration = self.durations.iter().sum();
    total / self.durations.len() as u32
  }
}

/// Guard ensuring the supervisor learns about every worker exit, panics
/// included.
struct ExitGuard {
  worker_id: u64,
  reports: mpsc::UnboundedSender<WorkerReport>,
}

impl Drop for ExitGuard {
  fn drop(&mut self) {
    let _ = self.reports.send(WorkerReport::Exited {
      worker_id: self.worker_id,
    });
  }
}

/// Fixed-size pool of execution workers with a priority-ordered queue.
pub struct DispatchPool {
  inner: Arc<Mutex<PoolInner>>,
  executor: Arc<dyn NodeExecutor>,
  reports: mpsc::UnboundedSender<WorkerReport>,
  supervisor: Mutex<Option<JoinHandle<()>>>,
  cancel: CancellationToken,
  max_workers: usize,
  shutdown_grace: Duration,
}

impl DispatchPool {
  /// Create a pool with `max_workers` workers executing via `executor`.
  ///
  /// # Errors
  /// Fails with a configuration error when `max_workers` is zero.
  pub fn new(
    executor: Arc<dyn NodeExecutor>,
    max_workers: usize,
    shutdown_grace: Duration,
  ) -> Result<Self, EngineError> {
    if max_workers < 1 {
      return Err(EngineError::configuration("max_workers must be at least 1"));
    }

    let (reports, report_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(Mutex::new(PoolInner {
      queue: BinaryHeap::new(),
      idle: Vec::new(),
      workers: HashMap::new(),
      in_flight: HashMap::new(),
      durations: VecDeque::with_capacity(DURATION_WINDOW),
      total_tasks: 0,
      completed_tasks: 0,
      failed_tasks: 0,
      next_seq: 0,
      next_worker_id: 0,
      accepting: true,
    }));

    let pool = Self {
      inner,
      executor,
      reports,
      supervisor: Mutex::new(None),
      cancel: CancellationToken::new(),
      max_workers,
      shutdown_grace,
    };

    for _ in 0..max_workers {
      pool.spawn_worker();
    }
    let supervisor = tokio::spawn(Self::supervise(
      Arc::clone(&pool.inner),
      report_rx,
      pool.reports.clone(),
      pool.cancel.clone(),
      pool.executor.clone(),
      pool.max_workers,
    ));
    *pool.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);

    info!(max_workers, "dispatch pool started");
    Ok(pool)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn spawn_worker(&self) {
    Self::spawn_worker_on(
      &self.inner,
      self.executor.clone(),
      self.reports.clone(),
      self.cancel.clone(),
    );
  }

  fn spawn_worker_on(
    inner: &Arc<Mutex<PoolInner>>,
    executor: Arc<dyn NodeExecutor>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
  ) {
    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
    guard.next_worker_id += 1;
    let worker_id = guard.next_worker_id;
    let (sender, receiver) = mpsc::unbounded_channel();

    let join = tokio::spawn(Self::worker_loop(
      worker_id,
      receiver,
      executor,
      reports,
      cancel,
    ));
    guard.workers.insert(worker_id, WorkerHandle { sender, join });
    debug!(worker_id, "worker spawned");
  }

  async fn worker_loop(
    worker_id: u64,
    mut tasks: mpsc::UnboundedReceiver<(WorkerTask, TaskResponder)>,
    executor: Arc<dyn NodeExecutor>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
  ) {
    let _guard = ExitGuard {
      worker_id,
      reports: reports.clone(),
    };
    let _ = reports.send(WorkerReport::Ready { worker_id });

    loop {
      let received = tokio::select! {
        _ = cancel.cancelled() => break,
        received = tasks.recv() => received,
      };
      let Some((task, responder)) = received else {
        break;
      };

      let _ = reports.send(WorkerReport::Started {
        worker_id,
        task_id: task.id.clone(),
      });

      let outputs = OutputsSnapshot::new(task.outputs_snapshot.clone());
      let result = executor.execute(&task.node, task.input.clone(), &outputs).await;

      let report = match &result {
        Ok(_) => WorkerReport::Completed {
          worker_id,
          task_id: task.id.clone(),
        },
        Err(e) => {
          warn!(
            worker_id,
            task_id = %task.id,
            node_id = %task.node_id,
            error = %e,
            "task failed"
          );
          WorkerReport::Failed {
            worker_id,
            task_id: task.id.clone(),
          }
        }
      };
      let _ = responder.send(result);
      let _ = reports.send(report);
    }
  }

  /// Supervisor loop: worker lifecycle and queue re-dispatch.
  async fn supervise(
    inner: Arc<Mutex<PoolInner>>,
    mut report_rx: mpsc::UnboundedReceiver<WorkerReport>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    cancel: CancellationToken,
    executor: Arc<dyn NodeExecutor>,
    max_workers: usize,
  ) {
    while let Some(report) = report_rx.recv().await {
      match report {
        WorkerReport::Ready { worker_id } => {
          let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
          if guard.workers.contains_key(&worker_id) {
            guard.idle.push(worker_id);
            guard.dispatch();
          }
        }
        WorkerReport::Started { worker_id, task_id } => {
          debug!(worker_id, task_id = %task_id, "task started");
        }
        WorkerReport::Completed { worker_id, task_id } => {
          let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
          guard.record_finished(&task_id, false);
          if guard.workers.contains_key(&worker_id) {
            guard.idle.push(worker_id);
          }
          guard.dispatch();
        }
        WorkerReport::Failed { worker_id, task_id } => {
          let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
          guard.record_finished(&task_id, true);
          if guard.workers.contains_key(&worker_id) {
            guard.idle.push(worker_id);
          }
          guard.dispatch();
        }
        WorkerReport::Exited { worker_id } => {
          if cancel.is_cancelled() {
            continue;
          }
          let respawn = {
            let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.workers.remove(&worker_id);
            guard.idle.retain(|id| *id != worker_id);

            // Any task still booked against the dead worker is lost; its
            // responder went down with the worker, so the submitter sees
            // an abandonment error from its handle.
            let lost: Vec<String> = guard
              .in_flight
              .iter()
              .filter(|(_, f)| f.worker_id == worker_id)
              .map(|(task_id, _)| task_id.clone())
              .collect();
            for task_id in lost {
              warn!(worker_id, task_id = %task_id, "in-flight task lost to worker exit");
              guard.record_finished(&task_id, true);
            }
            guard.workers.len() < max_workers
          };

          warn!(worker_id, "worker exited");
          if respawn {
            let reports = reports.clone();
            tokio::spawn(async move {
              tokio::time::sleep(RESPAWN_DELAY).await;
              let _ = reports.send(WorkerReport::RespawnDue);
            });
          }
        }
        WorkerReport::RespawnDue => {
          if cancel.is_cancelled() {
            continue;
          }
          let need = {
            let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.workers.len() < max_workers
          };
          // Duplicate replacement avoided: the count is re-checked here.
          if need {
            Self::spawn_worker_on(&inner, executor.clone(), reports.clone(), cancel.clone());
          }
        }
      }
    }
  }

  /// Submit a task. It is queued by priority and dispatched as soon as a
  /// worker is idle. The returned handle resolves to the task's result.
  pub fn submit(&self, task: WorkerTask) -> Result<TaskHandle, EngineError> {
    let (responder, receiver) = oneshot::channel();
    let task_id = task.id.clone();

    let mut guard = self.lock();
    if !guard.accepting {
      return Err(EngineError::Dispatch {
        task_id,
        message: "pool is shut down".to_string(),
      });
    }
    guard.next_seq += 1;
    let seq = guard.next_seq;
    guard.total_tasks += 1;
    guard.queue.push(QueuedTask {
      task,
      responder,
      seq,
    });
    guard.dispatch();

    Ok(TaskHandle { task_id, receiver })
  }

  /// Point-in-time metrics snapshot.
  pub fn metrics(&self) -> PoolMetrics {
    let guard = self.lock();
    PoolMetrics {
      total_tasks: guard.total_tasks,
      completed_tasks: guard.completed_tasks,
      failed_tasks: guard.failed_tasks,
      average_execution_time: guard.average_execution_time(),
      active_workers: guard.workers.len(),
      queue_length: guard.queue.len(),
    }
  }

  /// Stop the pool: refuse new work, wait up to the grace period for
  /// in-flight tasks to drain, then terminate all workers and drop any
  /// still-queued tasks (their handles resolve to an abandonment error).
  pub async fn shutdown(&self) {
    self.lock().accepting = false;

    let drained = tokio::time::timeout(self.shutdown_grace, async {
      loop {
        {
          let guard = self.lock();
          if guard.in_flight.is_empty() && guard.queue.is_empty() {
            break;
          }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
      }
    })
    .await;

    if drained.is_err() {
      warn!(
        grace = ?self.shutdown_grace,
        "pool shutdown grace period elapsed with tasks outstanding"
      );
    }

    self.cancel.cancel();
    let mut guard = self.lock();
    for (_, worker) in guard.workers.drain() {
      worker.join.abort();
    }
    guard.idle.clear();
    guard.in_flight.clear();
    guard.queue.clear();
    drop(guard);

    if let Some(supervisor) = self
      .supervisor
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take()
    {
      supervisor.abort();
    }
    info!("dispatch pool stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queued(priority: i32, seq: u64) -> QueuedTask {
    let (responder, _rx) = oneshot::channel();
    QueuedTask {
      task: WorkerTask {
        id: format!("t{seq}"),
        execution_id: "exec".to_string(),
        node_id: "n".to_string(),
        node: Node {
          id: "n".to_string(),
          node_type: "noop".to_string(),
          config: Default::default(),
        },
        input: json!(null),
        outputs_snapshot: HashMap::new(),
        priority,
      },
      responder,
      seq,
    }
  }

  #[test]
  fn test_queue_orders_by_priority_then_submission() {
    let mut heap = BinaryHeap::new();
    heap.push(queued(1, 1));
    heap.push(queued(5, 2));
    heap.push(queued(5, 3));
    heap.push(queued(3, 4));

    let order: Vec<String> = std::iter::from_fn(|| heap.pop())
      .map(|q| q.task.id)
      .collect();
    // Highest priority first; equal priorities keep submission order.
    assert_eq!(order, vec!["t2", "t3", "t4", "t1"]);
  }
}
