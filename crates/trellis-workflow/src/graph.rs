use std::collections::{HashMap, HashSet};

use crate::edge::Edge;
use crate::error::WorkflowError;
use crate::node::Node;

/// Graph structure for traversal and analysis.
///
/// Built from a workflow's nodes and edges; node order is preserved so that
/// traversal results are deterministic for a given definition.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Node ids in definition order.
  order: Vec<String>,
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Incoming edges per node, in edge definition order.
  incoming_edges: HashMap<String, Vec<Edge>>,
  /// Nodes with no incoming edges.
  entry_points: Vec<String>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  pub fn new(nodes: &[Node], edges: &[Edge]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut incoming_edges: HashMap<String, Vec<Edge>> = HashMap::new();

    let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();

    for node_id in &order {
      adjacency.entry(node_id.clone()).or_default();
      reverse_adjacency.entry(node_id.clone()).or_default();
      incoming_edges.entry(node_id.clone()).or_default();
    }

    for edge in edges {
      adjacency
        .entry(edge.source.clone())
        .or_default()
        .push(edge.target.clone());
      reverse_adjacency
        .entry(edge.target.clone())
        .or_default()
        .push(edge.source.clone());
      incoming_edges
        .entry(edge.target.clone())
        .or_default()
        .push(edge.clone());
    }

    let entry_points: Vec<String> = order
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    Self {
      order,
      adjacency,
      reverse_adjacency,
      incoming_edges,
      entry_points,
    }
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get incoming edges for a given node, in definition order.
  pub fn incoming_edges(&self, node_id: &str) -> &[Edge] {
    self
      .incoming_edges
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Compute a topological execution order using Kahn's algorithm.
  ///
  /// The queue is seeded with zero-in-degree nodes in definition order, so
  /// the result is deterministic for a given workflow. If the graph
  /// contains a cycle the nodes on it never reach zero in-degree; rather
  /// than silently excluding them, this fails with
  /// [`WorkflowError::CycleDetected`] naming the stuck nodes.
  pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
    let mut in_degree: HashMap<&str, usize> = self
      .order
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();

    let mut queue: Vec<&str> = self
      .order
      .iter()
      .map(String::as_str)
      .filter(|id| in_degree[id] == 0)
      .collect();

    let mut sorted = Vec::with_capacity(self.order.len());
    let mut head = 0;
    while head < queue.len() {
      let node_id = queue[head];
      head += 1;
      sorted.push(node_id.to_string());

      for next in self.downstream(node_id) {
        // Edges pointing at undeclared nodes are ignored here; Workflow::validate
        // rejects them up front.
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push(next);
          }
        }
      }
    }

    if sorted.len() < self.order.len() {
      let sorted_set: HashSet<&str> = sorted.iter().map(String::as_str).collect();
      let stuck: Vec<String> = self
        .order
        .iter()
        .filter(|id| !sorted_set.contains(id.as_str()))
        .cloned()
        .collect();
      return Err(WorkflowError::CycleDetected { nodes: stuck });
    }

    Ok(sorted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node(id: &str) -> Node {
    Node {
      id: id.to_string(),
      node_type: "noop".to_string(),
      config: Default::default(),
    }
  }

  fn edge(id: &str, source: &str, target: &str) -> Edge {
    Edge {
      id: id.to_string(),
      source: source.to_string(),
      target: target.to_string(),
      source_handle: None,
      target_handle: None,
    }
  }

  #[test]
  fn test_linear_chain_order() {
    let nodes = vec![node("a"), node("b"), node("c")];
    let edges = vec![edge("e1", "a", "b"), edge("e2", "b", "c")];
    let graph = Graph::new(&nodes, &edges);

    let order = graph.topological_order().unwrap();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(graph.entry_points(), &["a".to_string()]);
  }

  #[test]
  fn test_diamond_respects_dependencies() {
    let nodes = vec![node("a"), node("b"), node("c"), node("d")];
    let edges = vec![
      edge("e1", "a", "b"),
      edge("e2", "a", "c"),
      edge("e3", "b", "d"),
      edge("e4", "c", "d"),
    ];
    let graph = Graph::new(&nodes, &edges);

    let order = graph.topological_order().unwrap();
    let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("a") < pos("c"));
    assert!(pos("b") < pos("d"));
    assert!(pos("c") < pos("d"));
  }

  #[test]
  fn test_cycle_is_rejected() {
    let nodes = vec![node("a"), node("b"), node("c")];
    let edges = vec![
      edge("e1", "a", "b"),
      edge("e2", "b", "c"),
      edge("e3", "c", "b"),
    ];
    let graph = Graph::new(&nodes, &edges);

    let err = graph.topological_order().unwrap_err();
    match err {
      WorkflowError::CycleDetected { nodes } => {
        assert_eq!(nodes, vec!["b".to_string(), "c".to_string()]);
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn test_incoming_edges_preserve_handles() {
    let nodes = vec![node("a"), node("b"), node("c")];
    let mut e1 = edge("e1", "a", "c");
    e1.target_handle = Some("x".to_string());
    let e2 = edge("e2", "b", "c");
    let graph = Graph::new(&nodes, &[e1, e2]);

    let incoming = graph.incoming_edges("c");
    assert_eq!(incoming.len(), 2);
    assert_eq!(incoming[0].handle_key(), "x");
    assert_eq!(incoming[1].handle_key(), "b");
  }
}
