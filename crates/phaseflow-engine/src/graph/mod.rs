//! Workflow graph model and execution engine.
//!
//! A workflow is a directed graph of typed `WorkflowNode`s connected by
//! `WorkflowEdge`s, with a designated start and end node. The
//! `WorkflowExecutor` walks the graph from the start node, executing one node
//! at a time against a per-run `ExecutionState`, and either finishes or
//! pauses at an interactive node until a human answer arrives.

pub mod edge;
pub mod executor;
pub mod node;
pub mod state;
pub mod template;

pub use edge::{evaluate_condition, SimpleConditionEvaluator, WorkflowEdge};
pub use executor::{RunOutcome, RunScope, WorkflowExecutor, WorkflowResult};
pub use node::{NodeKind, WorkflowNode};
pub use state::ExecutionState;
pub use template::{WorkflowGraph, WorkflowTemplate};
