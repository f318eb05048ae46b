//! The external node-executor capability.
//!
//! The engine does not know how to run any concrete node type; it delegates
//! to a [`NodeExecutor`] supplied by the embedding application. Executors
//! see the node definition, its resolved input, and a read-only view of the
//! outputs produced so far.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use trellis_workflow::Node;

use crate::cache::OutputCache;
use crate::error::EngineError;

/// Read-only view of upstream outputs, handed to executors.
pub trait OutputsView: Send + Sync {
  /// Look up one node's output. `None` means no output is available.
  fn get(&self, node_id: &str) -> Option<Arc<Value>>;

  /// Snapshot of all available outputs.
  fn get_all(&self) -> HashMap<String, Value>;
}

impl OutputsView for OutputCache {
  fn get(&self, node_id: &str) -> Option<Arc<Value>> {
    OutputCache::get(self, node_id)
  }

  fn get_all(&self) -> HashMap<String, Value> {
    OutputCache::get_all(self)
  }
}

/// Executes a single node.
///
/// Implementations cover concrete node types (text generation, HTTP calls,
/// transforms, ...). A returned error is recorded against the node and,
/// unless the node is marked continue-on-error, halts the run.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
  async fn execute(
    &self,
    node: &Node,
    input: Value,
    outputs: &dyn OutputsView,
  ) -> Result<Value, EngineError>;
}

/// Outputs view backed by a static snapshot rather than a live cache.
///
/// Used by the dispatch pool, where a task carries the outputs that were
/// visible at submission time.
pub struct OutputsSnapshot {
  outputs: HashMap<String, Arc<Value>>,
}

impl OutputsSnapshot {
  pub fn new(outputs: HashMap<String, Value>) -> Self {
    Self {
      outputs: outputs.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
    }
  }
}

impl OutputsView for OutputsSnapshot {
  fn get(&self, node_id: &str) -> Option<Arc<Value>> {
    self.outputs.get(node_id).cloned()
  }

  fn get_all(&self) -> HashMap<String, Value> {
    self
      .outputs
      .iter()
      .map(|(k, v)| (k.clone(), v.as_ref().clone()))
      .collect()
  }
}
