//! Observability setup for Weft binaries.
//!
//! The engine itself only emits `tracing` events (`run_id`, `node_id` and
//! `node_type` fields); this crate decides where they go.

pub mod tracing_setup;
