//! reqwest-backed HTTP executor.
//!
//! One [`ReqwestExecutor`] per configured client. Each carries an optional
//! base URL and default headers from `[http.clients.<name>]`; the unnamed
//! default client uses only the engine-wide timeout and user agent.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use weft_core::http::{
    BoxHttpExecutor, HttpClientRegistry, HttpError, HttpExecutor, HttpRequest, HttpResponse,
};
use weft_types::config::{HttpClientSettings, HttpSettings};

/// Errors building the HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum HttpSetupError {
    #[error("failed to build http client '{name}': {source}")]
    Client {
        name: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Executes [`HttpRequest`]s with a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
}

impl ReqwestExecutor {
    pub fn new(settings: &HttpSettings, client: &HttpClientSettings) -> Result<Self, reqwest::Error> {
        let timeout = client.timeout_ms.unwrap_or(settings.timeout_ms);
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout))
            .user_agent(settings.user_agent.as_str())
            .build()?;

        Ok(Self {
            client: http_client,
            base_url: client.base_url.clone(),
            headers: client.headers.clone(),
        })
    }

    fn url(&self, url: &str) -> String {
        resolve_url(self.base_url.as_deref(), url)
    }
}

/// Prefix relative URLs with `base`. Absolute URLs pass through.
fn resolve_url(base: Option<&str>, url: &str) -> String {
    let absolute = url.starts_with("http://") || url.starts_with("https://");
    match base {
        Some(base) if !absolute => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        _ => url.to_string(),
    }
}

/// JSON bodies are parsed; anything else is kept as text.
fn parse_body(text: String) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn transport_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout
    } else if err.is_builder() {
        HttpError::InvalidRequest(err.to_string())
    } else {
        HttpError::Transport(err.to_string())
    }
}

impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpError::InvalidRequest(format!("invalid method: {}", request.method)))?;
        let url = self.url(&request.url);

        let mut builder = self.client.request(method, &url);
        for (key, value) in self.headers.iter().chain(request.headers.iter()) {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let text = response.text().await.map_err(transport_error)?;

        tracing::debug!(
            url = url.as_str(),
            status,
            body_len = text.len(),
            "http request completed"
        );

        Ok(HttpResponse {
            status,
            headers,
            body: parse_body(text),
        })
    }
}

/// Build the registry from `[http]` settings: an unnamed default client plus
/// one client per `[http.clients.<name>]` table.
pub fn registry_from_settings(settings: &HttpSettings) -> Result<HttpClientRegistry, HttpSetupError> {
    let build = |name: &str, client: &HttpClientSettings| {
        ReqwestExecutor::new(settings, client)
            .map(BoxHttpExecutor::new)
            .map_err(|source| HttpSetupError::Client {
                name: name.to_string(),
                source,
            })
    };

    let mut registry =
        HttpClientRegistry::new().with_default(build("default", &HttpClientSettings::default())?);
    for (name, client) in &settings.clients {
        registry.register(name.clone(), build(name, client)?);
    }
    tracing::debug!(clients = settings.clients.len(), "http clients configured");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relative_urls_join_base() {
        assert_eq!(
            resolve_url(Some("https://api.test/v1/"), "/users/7"),
            "https://api.test/v1/users/7"
        );
        assert_eq!(
            resolve_url(Some("https://api.test"), "https://other.test/x"),
            "https://other.test/x"
        );
        assert_eq!(resolve_url(None, "users"), "users");
    }

    #[test]
    fn body_parsing_falls_back_to_text() {
        assert_eq!(parse_body(r#"{"ok":true}"#.into()), json!({"ok": true}));
        assert_eq!(parse_body("plain".into()), json!("plain"));
        assert_eq!(parse_body(String::new()), Value::Null);
    }

    #[test]
    fn registry_has_default_and_named_clients() {
        let mut settings = HttpSettings::default();
        settings.clients.insert(
            "github".into(),
            HttpClientSettings {
                base_url: Some("https://api.github.com".into()),
                ..Default::default()
            },
        );

        let registry = registry_from_settings(&settings).unwrap();
        assert_eq!(registry.list_names(), vec!["github"]);
        assert!(registry.resolve(None).is_ok());
        assert!(registry.resolve(Some("github")).is_ok());
        assert!(registry.resolve(Some("gitlab")).is_err());
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let executor =
            ReqwestExecutor::new(&HttpSettings::default(), &HttpClientSettings::default()).unwrap();
        let err = executor
            .execute(HttpRequest {
                method: "NOT A METHOD".into(),
                url: "http://localhost".into(),
                headers: BTreeMap::new(),
                body: None,
                timeout: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(_)));
    }
}
