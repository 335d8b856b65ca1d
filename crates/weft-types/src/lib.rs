//! Shared domain types for Weft.
//!
//! This crate contains the in-memory graph model that workflow loaders must
//! produce (`Workflow`, `Node`, `Edge`, `NodeKind`), the per-run result types
//! the engine reports (`NodeResult`, `RunReport`), the error taxonomy shared by
//! every layer, and the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod node;
pub mod result;
pub mod workflow;
