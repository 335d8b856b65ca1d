//! Infrastructure layer for Weft.
//!
//! Concrete adapters for the ports defined in `weft-core`: a reqwest-backed
//! [`HttpExecutor`](weft_core::http::HttpExecutor), the `weft.toml` engine
//! configuration loader, and JSON/YAML workflow loading.

pub mod config;
pub mod http;
pub mod loader;
