use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::node::Node;

/// A workflow definition ready for execution.
///
/// Node order is preserved from the definition; it seeds the deterministic
/// topological ordering used by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  #[serde(alias = "workflowId")]
  pub workflow_id: String,
  #[serde(default)]
  pub name: String,
  pub nodes: Vec<Node>,
  pub edges: Vec<Edge>,
}

impl Workflow {
  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.nodes, &self.edges)
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&Node> {
    self.nodes.iter().find(|n| n.id == node_id)
  }

  /// Check definition-level well-formedness: unique node ids and edges
  /// that reference known nodes.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    let mut seen = std::collections::HashSet::new();
    for node in &self.nodes {
      if !seen.insert(node.id.as_str()) {
        return Err(WorkflowError::DuplicateNode(node.id.clone()));
      }
    }
    for edge in &self.edges {
      if !seen.contains(edge.source.as_str()) || !seen.contains(edge.target.as_str()) {
        return Err(WorkflowError::InvalidEdge {
          from: edge.source.clone(),
          to: edge.target.clone(),
        });
      }
    }
    Ok(())
  }
}
