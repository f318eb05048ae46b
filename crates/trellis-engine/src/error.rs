//! Engine errors.

use thiserror::Error;

/// Errors that can occur in the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// Invalid engine configuration, fatal at construction.
  #[error("invalid configuration: {message}")]
  Configuration { message: String },

  /// Lookup of an unknown execution in a mutating state operation.
  #[error("execution '{execution_id}' not found")]
  ExecutionNotFound { execution_id: String },

  /// An execution with this id is already registered.
  #[error("execution '{execution_id}' already exists")]
  ExecutionExists { execution_id: String },

  /// Node not found in the workflow.
  #[error("node '{node_id}' not found in workflow")]
  NodeNotFound { node_id: String },

  /// The external executor capability failed for a node.
  #[error("node '{node_id}' failed: {message}")]
  NodeExecution { node_id: String, message: String },

  /// The workflow graph could not be ordered for execution.
  #[error("invalid workflow graph: {source}")]
  InvalidGraph {
    #[from]
    source: trellis_workflow::WorkflowError,
  },

  /// The dispatch pool rejected or lost a task.
  #[error("dispatch failed for task '{task_id}': {message}")]
  Dispatch { task_id: String, message: String },
}

impl EngineError {
  pub(crate) fn configuration(message: impl Into<String>) -> Self {
    Self::Configuration {
      message: message.into(),
    }
  }
}
