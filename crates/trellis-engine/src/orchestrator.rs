//! Workflow orchestration.
//!
//! Drives one execution of one graph: computes execution order, resolves
//! each node's input from upstream outputs through the run's output cache,
//! invokes the external executor capability (or the built-in branch
//! handling for `if_else` / `switch`), records every transition in the
//! state store, and applies the per-node failure policy.
//!
//! Two modes:
//! - [`run`](Orchestrator::run) - sequential, node by node in topological
//!   order; node N always observes node N-1's committed cache write.
//! - [`run_pooled`](Orchestrator::run_pooled) - nodes whose upstream
//!   dependencies are all settled execute concurrently as waves through a
//!   shared [`DispatchPool`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trellis_workflow::{Graph, Node, Workflow};

use crate::cache::OutputCache;
use crate::condition::{evaluate_condition, resolve_field};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::pool::{DispatchPool, TaskHandle, WorkerTask};
use crate::state::{ExecutionStateStore, ExecutionStatus, NodeStatus, NodeUpdate};

/// Node types handled inline by the orchestrator.
const NODE_TYPE_IF_ELSE: &str = "if_else";
const NODE_TYPE_SWITCH: &str = "switch";

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Caller-supplied execution id, e.g. when resuming a logged execution.
  /// A fresh id is generated when absent.
  pub execution_id: Option<String>,
  pub user_id: Option<String>,
  /// Dispatch priority for this run's tasks in pooled mode.
  pub priority: i32,
  /// Outputs to pre-load into the run's cache before orchestration, to
  /// resume without re-running completed nodes.
  pub warm_outputs: Option<HashMap<String, Value>>,
  /// Pin warmed outputs so they cannot be evicted mid-run.
  pub persistent_warm: bool,
  pub cancel: CancellationToken,
}

/// Per-node record in a run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLog {
  pub node_id: String,
  pub node_name: String,
  pub status: NodeStatus,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// Structured result of one run.
///
/// Node-level failures do not surface as `Err`: they settle the run with
/// `status: failed` and an error here. `Err` is reserved for setup problems
/// (invalid graph, duplicate execution id, configuration).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
  pub execution_id: String,
  pub status: ExecutionStatus,
  pub output: Value,
  /// Per-node records, insertion-ordered by execution order.
  pub logs: Vec<NodeLog>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub duration_ms: u64,
}

/// Run-local context. Owned exclusively by one run, discarded at its end.
struct ExecutionContext {
  execution_id: String,
  workflow_id: String,
  #[allow(dead_code)]
  user_id: Option<String>,
  input: Value,
  /// Fresh per execution; never shared across runs.
  outputs: OutputCache,
  if_else_results: HashMap<String, bool>,
  switch_results: HashMap<String, Option<String>>,
}

/// What one node step produced.
enum StepOutcome {
  Output(Value),
  Failed(String),
}

/// Orchestrates workflow executions against a shared state store.
pub struct Orchestrator {
  state: Arc<ExecutionStateStore>,
  executor: Arc<dyn NodeExecutor>,
  config: EngineConfig,
}

impl Orchestrator {
  /// Create an orchestrator.
  ///
  /// # Errors
  /// Fails when the configuration is invalid.
  pub fn new(
    state: Arc<ExecutionStateStore>,
    executor: Arc<dyn NodeExecutor>,
    config: EngineConfig,
  ) -> Result<Self, EngineError> {
    config.validate()?;
    Ok(Self {
      state,
      executor,
      config,
    })
  }

  /// Shared state store, for subscriptions and lookups.
  pub fn state(&self) -> &Arc<ExecutionStateStore> {
    &self.state
  }

  fn build_context(
    &self,
    workflow: &Workflow,
    input: Value,
    options: &RunOptions,
  ) -> Result<ExecutionContext, EngineError> {
    let outputs =
      OutputCache::with_options(self.config.cache_max_size, self.config.cache_clone_on_get)?;
    if let Some(warm) = &options.warm_outputs {
      outputs.warm(warm.clone(), options.persistent_warm);
    }

    Ok(ExecutionContext {
      execution_id: options
        .execution_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
      workflow_id: workflow.workflow_id.clone(),
      user_id: options.user_id.clone(),
      input,
      outputs,
      if_else_results: HashMap::new(),
      switch_results: HashMap::new(),
    })
  }

  /// Execute the workflow sequentially, node by node in topological order.
  pub async fn run(
    &self,
    workflow: &Workflow,
    input: Value,
    options: RunOptions,
  ) -> Result<RunResult, EngineError> {
    workflow.validate()?;
    let graph = workflow.graph();
    let order = graph.topological_order()?;

    let mut ctx = self.build_context(workflow, input, &options)?;
    let started = Utc::now();
    self.state.initialize_execution(
      &ctx.execution_id,
      &ctx.workflow_id,
      order.len(),
      Some(ctx.input.clone()),
    )?;
    info!(
      execution_id = %ctx.execution_id,
      workflow_id = %ctx.workflow_id,
      nodes = order.len(),
      "execution started"
    );

    let mut logs: Vec<NodeLog> = Vec::with_capacity(order.len());
    let mut last_output = ctx.input.clone();
    let mut run_error: Option<String> = None;

    for (position, node_id) in order.iter().enumerate() {
      if options.cancel.is_cancelled() {
        warn!(execution_id = %ctx.execution_id, "execution cancelled");
        // Cancel first so the skips below cannot settle the aggregate.
        self.state.cancel_execution(&ctx.execution_id)?;
        self.skip_nodes(&ctx.execution_id, workflow, &order[position..], &mut logs)?;
        return Ok(self.finish(&ctx, started, last_output, logs, None));
      }

      let node = workflow
        .get_node(node_id)
        .ok_or_else(|| EngineError::NodeNotFound {
          node_id: node_id.clone(),
        })?;

      let (outcome, log) = self.run_node(node, &graph, &mut ctx).await?;
      logs.push(log);

      match outcome {
        StepOutcome::Output(output) => {
          last_output = output;
        }
        StepOutcome::Failed(message) => {
          if node.config.continue_on_error {
            // Output stays uncached; downstream nodes fall back.
            warn!(
              execution_id = %ctx.execution_id,
              node_id = %node.id,
              "node failed, continuing per configuration"
            );
            continue;
          }
          error!(
            execution_id = %ctx.execution_id,
            node_id = %node.id,
            error = %message,
            "node failed, halting execution"
          );
          run_error = Some(message);
          self.skip_nodes(&ctx.execution_id, workflow, &order[position + 1..], &mut logs)?;
          break;
        }
      }
    }

    self.finalize(&ctx, &last_output, &run_error)?;
    Ok(self.finish(&ctx, started, last_output, logs, run_error))
  }

  /// Execute one node: state transitions, input resolution, invocation.
  async fn run_node(
    &self,
    node: &Node,
    graph: &Graph,
    ctx: &mut ExecutionContext,
  ) -> Result<(StepOutcome, NodeLog), EngineError> {
    self.state.update_node_state(
      &ctx.execution_id,
      &node.id,
      node.name(),
      NodeStatus::Pending,
      NodeUpdate::default(),
    )?;

    let input = self.resolve_input(graph, &node.id, ctx);
    self.state.update_node_state(
      &ctx.execution_id,
      &node.id,
      node.name(),
      NodeStatus::Running,
      NodeUpdate::with_input(input.clone()),
    )?;
    let started_at = Utc::now();

    let result = self.invoke(node, input.clone(), ctx).await;
    let finished_at = Utc::now();

    match result {
      Ok(output) => {
        ctx.outputs.set(&node.id, output.clone(), false);
        self.state.update_node_state(
          &ctx.execution_id,
          &node.id,
          node.name(),
          NodeStatus::Success,
          NodeUpdate::with_output(output.clone()),
        )?;
        let log = NodeLog {
          node_id: node.id.clone(),
          node_name: node.name().to_string(),
          status: NodeStatus::Success,
          started_at,
          finished_at,
          input: Some(input),
          output: Some(output.clone()),
          error: None,
        };
        Ok((StepOutcome::Output(output), log))
      }
      Err(e) => {
        let message = e.to_string();
        self.state.update_node_state(
          &ctx.execution_id,
          &node.id,
          node.name(),
          NodeStatus::Error,
          NodeUpdate::with_error(message.clone()),
        )?;
        let log = NodeLog {
          node_id: node.id.clone(),
          node_name: node.name().to_string(),
          status: NodeStatus::Error,
          started_at,
          finished_at,
          input: Some(input),
          output: None,
          error: Some(message.clone()),
        };
        Ok((StepOutcome::Failed(message), log))
      }
    }
  }

  /// Invoke a node: branch nodes are handled inline, everything else goes
  /// to the external executor capability.
  async fn invoke(
    &self,
    node: &Node,
    input: Value,
    ctx: &mut ExecutionContext,
  ) -> Result<Value, EngineError> {
    match node.node_type.as_str() {
      NODE_TYPE_IF_ELSE => {
        let branch = self.evaluate_if_else(node, ctx);
        ctx.if_else_results.insert(node.id.clone(), branch);
        Ok(json!({ "branch": branch }))
      }
      NODE_TYPE_SWITCH => {
        let case = self.evaluate_switch(node, &input, ctx);
        ctx.switch_results.insert(node.id.clone(), case.clone());
        Ok(json!({ "case": case }))
      }
      _ => self.executor.execute(node, input, &ctx.outputs).await,
    }
  }

  /// Evaluate an `if_else` node's condition against cached outputs.
  ///
  /// Evaluation problems never abort the run: a missing or out-of-grammar
  /// condition records `false` and continues.
  fn evaluate_if_else(&self, node: &Node, ctx: &ExecutionContext) -> bool {
    let Some(expression) = node.config.condition.as_deref() else {
      warn!(
        execution_id = %ctx.execution_id,
        node_id = %node.id,
        "if_else node has no condition, defaulting to false"
      );
      return false;
    };
    match evaluate_condition(expression, &ctx.outputs) {
      Ok(branch) => branch,
      Err(e) => {
        warn!(
          execution_id = %ctx.execution_id,
          node_id = %node.id,
          error = %e,
          "condition evaluation failed, defaulting to false"
        );
        false
      }
    }
  }

  /// Resolve a `switch` node's case from its input: first exact match on
  /// the configured field's string form, else the configured default, else
  /// none. Missing data never aborts the run.
  fn evaluate_switch(&self, node: &Node, input: &Value, ctx: &ExecutionContext) -> Option<String> {
    let default = || node.config.default_case.clone();

    let Some(field) = node.config.field.as_deref() else {
      warn!(
        execution_id = %ctx.execution_id,
        node_id = %node.id,
        "switch node has no field configured, using default case"
      );
      return default();
    };
    let Some(actual) = resolve_field(input, field) else {
      return default();
    };

    node
      .config
      .cases
      .iter()
      .find(|case| case.value == actual)
      .map(|case| case.label.clone())
      .or_else(default)
  }

  /// Resolve a node's input from upstream cached outputs.
  ///
  /// Zero incoming edges: the execution's original input. One edge: the
  /// source's cached output, falling back to the original input when the
  /// source has none (evicted or never ran). Multiple edges: a mapping
  /// keyed by handle name containing only the available outputs; an empty
  /// merge falls back to the original input.
  fn resolve_input(&self, graph: &Graph, node_id: &str, ctx: &ExecutionContext) -> Value {
    let incoming = graph.incoming_edges(node_id);
    match incoming {
      [] => ctx.input.clone(),
      [only] => ctx
        .outputs
        .get(&only.source)
        .map(|v| v.as_ref().clone())
        .unwrap_or_else(|| ctx.input.clone()),
      edges => {
        let mut merged = serde_json::Map::new();
        for edge in edges {
          if let Some(value) = ctx.outputs.get(&edge.source) {
            merged.insert(edge.handle_key().to_string(), value.as_ref().clone());
          }
        }
        if merged.is_empty() {
          ctx.input.clone()
        } else {
          Value::Object(merged)
        }
      }
    }
  }

  /// Mark nodes that will never run as skipped, so the aggregate state
  /// settles deterministically.
  fn skip_nodes(
    &self,
    execution_id: &str,
    workflow: &Workflow,
    node_ids: &[String],
    logs: &mut Vec<NodeLog>,
  ) -> Result<(), EngineError> {
    let now = Utc::now();
    for node_id in node_ids {
      let name = workflow
        .get_node(node_id)
        .map(|n| n.name().to_string())
        .unwrap_or_else(|| node_id.clone());
      self.state.update_node_state(
        execution_id,
        node_id,
        &name,
        NodeStatus::Skipped,
        NodeUpdate::default(),
      )?;
      logs.push(NodeLog {
        node_id: node_id.clone(),
        node_name: name,
        status: NodeStatus::Skipped,
        started_at: now,
        finished_at: now,
        input: None,
        output: None,
        error: None,
      });
    }
    Ok(())
  }

  /// Record final output / run-level error through the state store.
  fn finalize(
    &self,
    ctx: &ExecutionContext,
    last_output: &Value,
    run_error: &Option<String>,
  ) -> Result<(), EngineError> {
    match run_error {
      Some(message) => self.state.set_execution_error(&ctx.execution_id, message),
      None => {
        self
          .state
          .set_execution_output(&ctx.execution_id, last_output.clone())
      }
    }
  }

  /// Assemble the run result from the settled state.
  fn finish(
    &self,
    ctx: &ExecutionContext,
    started: DateTime<Utc>,
    output: Value,
    logs: Vec<NodeLog>,
    error: Option<String>,
  ) -> RunResult {
    let status = self
      .state
      .get_execution_state(&ctx.execution_id)
      .map(|s| s.status)
      .unwrap_or(ExecutionStatus::Failed);
    let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

    match status {
      ExecutionStatus::Failed => {
        error!(execution_id = %ctx.execution_id, "execution failed");
      }
      ExecutionStatus::Cancelled => {
        warn!(execution_id = %ctx.execution_id, "execution ended cancelled");
      }
      _ => {
        info!(
          execution_id = %ctx.execution_id,
          duration_ms,
          "execution completed"
        );
      }
    }

    RunResult {
      execution_id: ctx.execution_id.clone(),
      status,
      output,
      logs,
      error,
      duration_ms,
    }
  }

  /// Execute the workflow through a shared dispatch pool.
  ///
  /// Nodes whose upstream dependencies have all settled execute
  /// concurrently as one wave. Fail-fast lets the current wave drain, then
  /// halts; continue-on-error nodes do not halt. The pool is process-wide:
  /// its queue ordering arbitrates between concurrently running
  /// executions.
  pub async fn run_pooled(
    &self,
    workflow: &Workflow,
    input: Value,
    pool: &DispatchPool,
    options: RunOptions,
  ) -> Result<RunResult, EngineError> {
    workflow.validate()?;
    let graph = workflow.graph();
    // Fail fast on cycles even though waves are computed from readiness.
    let order = graph.topological_order()?;

    let mut ctx = self.build_context(workflow, input, &options)?;
    let started = Utc::now();
    self.state.initialize_execution(
      &ctx.execution_id,
      &ctx.workflow_id,
      order.len(),
      Some(ctx.input.clone()),
    )?;
    info!(
      execution_id = %ctx.execution_id,
      workflow_id = %ctx.workflow_id,
      nodes = order.len(),
      "pooled execution started"
    );

    let mut settled: HashSet<String> = HashSet::new();
    let mut logs: Vec<NodeLog> = Vec::with_capacity(order.len());
    let mut last_output = ctx.input.clone();
    let mut run_error: Option<String> = None;

    'waves: loop {
      if options.cancel.is_cancelled() {
        warn!(execution_id = %ctx.execution_id, "pooled execution cancelled");
        // Cancel first so the skips below cannot settle the aggregate.
        self.state.cancel_execution(&ctx.execution_id)?;
        let remaining = self.unsettled(&order, &settled);
        self.skip_nodes(&ctx.execution_id, workflow, &remaining, &mut logs)?;
        return Ok(self.finish(&ctx, started, last_output, logs, None));
      }

      let ready = self.find_ready(&order, &graph, &settled);
      if ready.is_empty() {
        break;
      }

      // Branch nodes settle inline; the rest go to the pool as one wave.
      let mut wave: Vec<(String, Value, TaskHandle)> = Vec::new();
      for node_id in &ready {
        let node = workflow
          .get_node(node_id)
          .ok_or_else(|| EngineError::NodeNotFound {
            node_id: node_id.clone(),
          })?;

        if node.node_type == NODE_TYPE_IF_ELSE || node.node_type == NODE_TYPE_SWITCH {
          let (outcome, log) = self.run_node(node, &graph, &mut ctx).await?;
          logs.push(log);
          settled.insert(node_id.clone());
          if let StepOutcome::Output(output) = outcome {
            last_output = output;
          }
          continue;
        }

        self.state.update_node_state(
          &ctx.execution_id,
          &node.id,
          node.name(),
          NodeStatus::Pending,
          NodeUpdate::default(),
        )?;
        let node_input = self.resolve_input(&graph, node_id, &ctx);
        self.state.update_node_state(
          &ctx.execution_id,
          &node.id,
          node.name(),
          NodeStatus::Running,
          NodeUpdate::with_input(node_input.clone()),
        )?;

        let priority = node.config.priority.unwrap_or(options.priority);
        let handle = pool.submit(WorkerTask {
          id: uuid::Uuid::new_v4().to_string(),
          execution_id: ctx.execution_id.clone(),
          node_id: node.id.clone(),
          node: node.clone(),
          input: node_input.clone(),
          outputs_snapshot: ctx.outputs.get_all(),
          priority,
        })?;
        wave.push((node.id.clone(), node_input, handle));
      }

      let wave_started = Utc::now();
      let results = futures::future::join_all(wave.into_iter().map(
        |(node_id, node_input, handle)| async move {
          let result = handle.wait().await;
          (node_id, node_input, result, Utc::now())
        },
      ))
      .await;

      for (node_id, node_input, result, finished_at) in results {
        let node = workflow
          .get_node(&node_id)
          .ok_or_else(|| EngineError::NodeNotFound {
            node_id: node_id.clone(),
          })?;
        let started_at = self
          .state
          .get_node_state(&ctx.execution_id, &node_id)
          .and_then(|n| n.start_time)
          .unwrap_or(wave_started);
        settled.insert(node_id.clone());

        match result {
          Ok(output) => {
            ctx.outputs.set(&node_id, output.clone(), false);
            self.state.update_node_state(
              &ctx.execution_id,
              &node_id,
              node.name(),
              NodeStatus::Success,
              NodeUpdate::with_output(output.clone()),
            )?;
            logs.push(NodeLog {
              node_id: node_id.clone(),
              node_name: node.name().to_string(),
              status: NodeStatus::Success,
              started_at,
              finished_at,
              input: Some(node_input),
              output: Some(output.clone()),
              error: None,
            });
            last_output = output;
          }
          Err(e) => {
            let message = e.to_string();
            self.state.update_node_state(
              &ctx.execution_id,
              &node_id,
              node.name(),
              NodeStatus::Error,
              NodeUpdate::with_error(message.clone()),
            )?;
            logs.push(NodeLog {
              node_id: node_id.clone(),
              node_name: node.name().to_string(),
              status: NodeStatus::Error,
              started_at,
              finished_at,
              input: Some(node_input),
              output: None,
              error: Some(message.clone()),
            });
            if !node.config.continue_on_error {
              error!(
                execution_id = %ctx.execution_id,
                node_id = %node_id,
                error = %message,
                "node failed, halting pooled execution after wave"
              );
              run_error = Some(message);
              let remaining = self.unsettled(&order, &settled);
              self.skip_nodes(&ctx.execution_id, workflow, &remaining, &mut logs)?;
              break 'waves;
            }
            warn!(
              execution_id = %ctx.execution_id,
              node_id = %node_id,
              "node failed, continuing per configuration"
            );
          }
        }
      }
    }

    self.finalize(&ctx, &last_output, &run_error)?;
    Ok(self.finish(&ctx, started, last_output, logs, run_error))
  }

  fn find_ready(&self, order: &[String], graph: &Graph, settled: &HashSet<String>) -> Vec<String> {
    order
      .iter()
      .filter(|id| !settled.contains(*id))
      .filter(|id| graph.upstream(id).iter().all(|up| settled.contains(up)))
      .cloned()
      .collect()
  }

  fn unsettled(&self, order: &[String], settled: &HashSet<String>) -> Vec<String> {
    order
      .iter()
      .filter(|id| !settled.contains(*id))
      .cloned()
      .collect()
  }
}
