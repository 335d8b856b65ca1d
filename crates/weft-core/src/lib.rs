//! Execution core for Weft.
//!
//! Holds the expression evaluator, the workflow scheduler and node behaviors,
//! and the store and HTTP traits the engine is wired with. Concrete adapters
//! (reqwest, config files, workflow loaders) live in `weft-infra`.

pub mod expression;
pub mod http;
pub mod storage;
pub mod workflow;
