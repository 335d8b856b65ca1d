//! Global variable store trait and its type-erased wrapper.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::StoreError;

/// Read-modify-write closure applied under the key's lock.
pub type UpdateFn = Box<dyn FnOnce(Option<Value>) -> Value + Send>;

/// Process-wide named slots (`global` scope variables, global counters).
///
/// `update` must be atomic per key so concurrent increments never lose writes.
pub trait VariableStore: Send + Sync {
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    fn set(&self, name: &str, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, name: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Apply `f` to the current value and store the result, returning it.
    fn update(
        &self,
        name: &str,
        f: UpdateFn,
    ) -> impl Future<Output = Result<Value, StoreError>> + Send;
}

/// Object-safe version of [`VariableStore`] with boxed futures.
pub trait VariableStoreDyn: Send + Sync {
    fn get_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>>;

    fn set_boxed<'a>(
        &'a self,
        name: &'a str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn delete_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn update_boxed<'a>(
        &'a self,
        name: &'a str,
        f: UpdateFn,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StoreError>> + Send + 'a>>;
}

impl<T: VariableStore> VariableStoreDyn for T {
    fn get_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, StoreError>> + Send + 'a>> {
        Box::pin(self.get(name))
    }

    fn set_boxed<'a>(
        &'a self,
        name: &'a str,
        value: Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.set(name, value))
    }

    fn delete_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.delete(name))
    }

    fn update_boxed<'a>(
        &'a self,
        name: &'a str,
        f: UpdateFn,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StoreError>> + Send + 'a>> {
        Box::pin(self.update(name, f))
    }
}

/// Type-erased variable store injected into the engine.
pub struct BoxVariableStore {
    inner: Box<dyn VariableStoreDyn>,
}

impl BoxVariableStore {
    pub fn new<T: VariableStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get_boxed(name).await
    }

    pub async fn set(&self, name: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set_boxed(name, value).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete_boxed(name).await
    }

    pub async fn update(&self, name: &str, f: UpdateFn) -> Result<Value, StoreError> {
        self.inner.update_boxed(name, f).await
    }
}
