//! Engine configuration.

use std::time::Duration;

use crate::error::EngineError;

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Maximum number of non-persistent entries held by a run's output cache.
  pub cache_max_size: usize,
  /// When true, `get` on the output cache returns an independent deep copy.
  pub cache_clone_on_get: bool,
  /// Number of workers in the dispatch pool.
  pub max_workers: usize,
  /// Grace period for pool shutdown before in-flight tasks are aborted.
  pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      cache_max_size: 100,
      cache_clone_on_get: false,
      max_workers: 5,
      shutdown_grace: Duration::from_secs(30),
    }
  }
}

impl EngineConfig {
  /// Validate the configuration.
  pub fn validate(&self) -> Result<(), EngineError> {
    if self.cache_max_size < 1 {
      return Err(EngineError::configuration(
        "cache_max_size must be at least 1",
      ));
    }
    if self.max_workers < 1 {
      return Err(EngineError::configuration("max_workers must be at least 1"));
    }
    Ok(())
  }
}
