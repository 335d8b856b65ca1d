//! Workflow engine core: validation, execution planning and scheduling.
//!
//! - `validate` -- structural checks run before anything executes
//! - `graph` -- execution plan: topological order, scoped bodies, join regions
//! - `context` -- per-run state and the frames node results live in
//! - `nodes` -- leaf behaviors for every non-scoped node kind
//! - `scheduler` -- readiness, pruning, joins and concurrent dispatch of a scope
//! - `scoped` -- loops, retry, try/catch and timeout bodies
//! - `retry` -- retry decisions and backoff delays
//! - `executor` -- the engine entry point and run report

pub mod context;
pub mod executor;
pub mod graph;
pub mod nodes;
pub mod retry;
pub mod scheduler;
pub mod scoped;
pub mod validate;

pub use executor::{EngineBuilder, RunError, WorkflowEngine, WorkflowExecutor};
pub use graph::ExecutionPlan;
pub use validate::ValidationError;
