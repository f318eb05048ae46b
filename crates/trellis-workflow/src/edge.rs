use serde::{Deserialize, Serialize};

/// A directed dependency from one node's output to another node's input slot.
///
/// Handles name the input slot on the target side; when a target node has
/// multiple incoming edges, its merged input is keyed by each edge's
/// `target_handle` (falling back to the source node id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
  pub id: String,
  pub source: String,
  pub target: String,
  #[serde(
    default,
    alias = "sourceHandle",
    skip_serializing_if = "Option::is_none"
  )]
  pub source_handle: Option<String>,
  #[serde(
    default,
    alias = "targetHandle",
    skip_serializing_if = "Option::is_none"
  )]
  pub target_handle: Option<String>,
}

impl Edge {
  /// Key under which this edge's upstream output appears in a merged input.
  pub fn handle_key(&self) -> &str {
    self
      .target_handle
      .as_deref()
      .or(self.source_handle.as_deref())
      .unwrap_or(&self.source)
  }
}
