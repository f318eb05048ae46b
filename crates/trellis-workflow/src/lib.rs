//! Trellis Workflow
//!
//! This crate provides the workflow definition types for trellis.
//! A workflow is an ordered set of typed nodes plus directed edges
//! describing data dependencies between them.
//!
//! Key pieces:
//! - [`Workflow`] - the serializable workflow definition
//! - [`Graph`] - adjacency structure built from a workflow, with
//!   topological ordering (Kahn) and cycle detection
//! - [`Node`] / [`Edge`] - definition types matching the visual editor's
//!   wire format

mod edge;
mod error;
mod graph;
mod node;
mod workflow;

pub use edge::Edge;
pub use error::WorkflowError;
pub use graph::Graph;
pub use node::{Node, NodeConfig, SwitchCase};
pub use workflow::Workflow;
