//! Storage abstractions for cross-run state.
//!
//! The cache and the global variable store outlive individual runs and are
//! shared by concurrent branches. Both are injected into the engine behind
//! object-safe wrappers; in-memory implementations live in [`memory`].

pub mod cache;
pub mod memory;
pub mod variables;

pub use cache::{BoxCacheStore, CachePolicy, CacheStore};
pub use memory::{MemoryCacheStore, MemoryVariableStore};
pub use variables::{BoxVariableStore, UpdateFn, VariableStore};

/// Errors raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for weft_types::error::NodeError {
    fn from(err: StoreError) -> Self {
        weft_types::error::NodeError::resource(err.to_string())
    }
}
