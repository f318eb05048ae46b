use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work in a workflow graph.
///
/// The `node_type` string selects the executor (or, for `if_else` /
/// `switch`, the orchestrator's built-in branch handling). Executor-specific
/// options live in the flattened tail of [`NodeConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id: String,
  #[serde(rename = "type", alias = "nodeType")]
  pub node_type: String,
  #[serde(default)]
  pub config: NodeConfig,
}

/// Per-node configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeConfig {
  /// Display label, falls back to the node type when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,

  /// When true, a failure of this node does not halt the run.
  #[serde(default, alias = "continueOnError")]
  pub continue_on_error: bool,

  /// Condition expression for `if_else` nodes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,

  /// Input field inspected by `switch` nodes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,

  /// Case labels for `switch` nodes, matched in order.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub cases: Vec<SwitchCase>,

  /// Fallback case label for `switch` nodes when no case matches.
  #[serde(default, alias = "defaultCase", skip_serializing_if = "Option::is_none")]
  pub default_case: Option<String>,

  /// Dispatch priority when the node runs through the pool.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<i32>,

  /// Executor-specific options, passed through untouched.
  #[serde(flatten)]
  pub options: HashMap<String, Value>,
}

/// One case of a `switch` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
  /// String form the inspected field is compared against.
  pub value: String,
  /// Label recorded when this case matches.
  pub label: String,
}

impl Node {
  /// Display name: configured label, or the node type.
  pub fn name(&self) -> &str {
    self.config.label.as_deref().unwrap_or(&self.node_type)
  }
}
