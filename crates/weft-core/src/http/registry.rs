//! Named HTTP client lookup.

use std::collections::HashMap;

use weft_types::error::NodeError;

use super::BoxHttpExecutor;

/// Executors indexed by client name, plus an optional default.
///
/// Lookup of an unknown name fails at run time with an invocation error;
/// workflows are not rejected at load time for naming a client the process
/// has not registered.
#[derive(Debug, Default)]
pub struct HttpClientRegistry {
    default: Option<BoxHttpExecutor>,
    clients: HashMap<String, BoxHttpExecutor>,
}

impl HttpClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor used when a node names no client.
    pub fn set_default(&mut self, executor: BoxHttpExecutor) {
        self.default = Some(executor);
    }

    pub fn with_default(mut self, executor: BoxHttpExecutor) -> Self {
        self.set_default(executor);
        self
    }

    /// Register a client under the given name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, executor: BoxHttpExecutor) {
        self.clients.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Option<&BoxHttpExecutor> {
        self.clients.get(name)
    }

    /// Resolve the executor for a node's optional `client` field.
    pub fn resolve(&self, name: Option<&str>) -> Result<&BoxHttpExecutor, NodeError> {
        match name {
            Some(name) => self
                .clients
                .get(name)
                .ok_or_else(|| NodeError::invocation(format!("unknown http client '{name}'"))),
            None => self
                .default
                .as_ref()
                .ok_or_else(|| NodeError::invocation("no default http client configured")),
        }
    }

    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
