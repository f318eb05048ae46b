//! State-change broadcast contract.
//!
//! These are the messages a presentation layer receives while an execution
//! runs. The engine produces them; transport (websocket, SSE, ...) is the
//! embedder's concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ExecutionStatus, NodeStatus};

/// A message in the state-change broadcast stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateEvent {
  /// One node changed state.
  #[serde(rename = "NODE_UPDATE", rename_all = "camelCase")]
  NodeUpdate {
    execution_id: String,
    node_id: String,
    status: NodeStatus,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },

  /// Execution-level aggregate changed, or a subscriber just attached.
  #[serde(rename = "EXECUTION_SNAPSHOT", rename_all = "camelCase")]
  ExecutionSnapshot {
    execution_id: String,
    status: ExecutionStatus,
    progress: f64,
    total_nodes: usize,
    completed_nodes: usize,
    start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
  },
}

impl StateEvent {
  /// The execution this event belongs to.
  pub fn execution_id(&self) -> &str {
    match self {
      StateEvent::NodeUpdate { execution_id, .. } => execution_id,
      StateEvent::ExecutionSnapshot { execution_id, .. } => execution_id,
    }
  }
}
