//! HTTP request/response contract consumed by `http` nodes.
//!
//! The engine never talks to the network directly. It builds an
//! [`HttpRequest`], looks up an executor by the node's optional `client` name
//! in the [`HttpClientRegistry`] and awaits the [`HttpResponse`]. A reqwest
//! backed executor lives in `weft-infra`.

pub mod registry;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::error::{ErrorKind, NodeError};

pub use registry::HttpClientRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise a string.
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The node-level output shape.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<HttpError> for NodeError {
    fn from(err: HttpError) -> Self {
        let kind = match err {
            HttpError::Timeout => ErrorKind::Timeout,
            HttpError::InvalidRequest(_) => ErrorKind::Invocation,
            HttpError::Transport(_) => ErrorKind::Http,
        };
        NodeError::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// HttpExecutor
// ---------------------------------------------------------------------------

/// Something that can perform an HTTP request.
///
/// Uses RPITIT (native async fn in traits); wrap in [`BoxHttpExecutor`] for
/// dynamic dispatch.
pub trait HttpExecutor: Send + Sync {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, HttpError>> + Send;
}

/// Object-safe version of [`HttpExecutor`] with boxed futures.
pub trait HttpExecutorDyn: Send + Sync {
    fn execute_boxed(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + '_>>;
}

impl<T: HttpExecutor> HttpExecutorDyn for T {
    fn execute_boxed(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased executor stored in the registry.
pub struct BoxHttpExecutor {
    inner: Box<dyn HttpExecutorDyn>,
}

impl BoxHttpExecutor {
    pub fn new<T: HttpExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.inner.execute_boxed(request).await
    }
}

impl std::fmt::Debug for BoxHttpExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxHttpExecutor").finish_non_exhaustive()
    }
}
