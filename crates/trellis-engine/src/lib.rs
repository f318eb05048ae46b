//! Trellis Execution Engine
//!
//! This crate executes workflow graphs defined by `trellis-workflow`:
//! it computes a valid execution order, dispatches each node, propagates
//! outputs between dependent nodes through a bounded cache, and tracks
//! live per-node and per-execution state for external observers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                          │
//! │  - run(workflow, input) / run_pooled(workflow, input, pool) │
//! │  - topological ordering, input resolution, branch handling  │
//! │  - failure policy (fail-fast / continue-on-error)           │
//! └──────────┬──────────────────┬──────────────────┬────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌───────────────────┐
//! │   OutputCache   │ │   DispatchPool   │ │ExecutionStateStore│
//! │  LRU + pinning  │ │ priority queue + │ │  state machine +  │
//! │  per-run, warm  │ │ worker lifecycle │ │ subscriber fanout │
//! └─────────────────┘ └────────┬─────────┘ └───────────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!                    │   NodeExecutor   │  external capability
//!                    └──────────────────┘
//! ```
//!
//! The state store and dispatch pool are process-wide and injected into
//! the orchestrator; the output cache is created fresh per execution.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use trellis_engine::{EngineConfig, ExecutionStateStore, Orchestrator, RunOptions};
//!
//! let state = Arc::new(ExecutionStateStore::new());
//! let orchestrator = Orchestrator::new(state, executor, EngineConfig::default())?;
//!
//! let result = orchestrator
//!     .run(&workflow, serde_json::json!({ "query": "hello" }), RunOptions::default())
//!     .await?;
//! println!("{:?}: {}", result.status, result.output);
//! ```

mod cache;
mod condition;
mod config;
mod error;
mod events;
mod executor;
mod orchestrator;
mod pool;
mod state;

pub use cache::{CacheStats, OutputCache};
pub use condition::{ConditionError, evaluate_condition, resolve_field};
pub use config::EngineConfig;
pub use error::EngineError;
pub use events::StateEvent;
pub use executor::{NodeExecutor, OutputsSnapshot, OutputsView};
pub use orchestrator::{NodeLog, Orchestrator, RunOptions, RunResult};
pub use pool::{DispatchPool, PoolMetrics, TaskHandle, WorkerTask};
pub use state::{
  ExecutionState, ExecutionStateStore, ExecutionStatus, NodeExecutionState, NodeStatus,
  NodeUpdate, SubscriptionId,
};
