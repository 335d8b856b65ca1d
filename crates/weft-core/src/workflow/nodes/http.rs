//! The `http` node: render the request, hand it to a registered client.

use std::time::Duration;

use serde_json::Value;
use weft_types::error::{ErrorKind, NodeError};
use weft_types::node::HttpConfig;

use crate::expression::{Bindings, render_template};
use crate::http::HttpRequest;

use super::{NodeCall, Outcome};

fn render(call: &NodeCall<'_>, template: &str, bindings: &dyn Bindings) -> Result<String, NodeError> {
    render_template(call.ctx.evaluator(), template, bindings)
        .map_err(|e| e.into_node_error(template))
}

/// Render every string leaf of a JSON body.
fn render_body(
    call: &NodeCall<'_>,
    body: &Value,
    bindings: &dyn Bindings,
) -> Result<Value, NodeError> {
    Ok(match body {
        Value::String(s) => Value::String(render(call, s, bindings)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_body(call, v, bindings))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_body(call, v, bindings)?)))
                .collect::<Result<_, NodeError>>()?,
        ),
        other => other.clone(),
    })
}

pub async fn request(call: &NodeCall<'_>, cfg: &HttpConfig) -> Result<Outcome, NodeError> {
    let request = {
        let bindings = call.bindings();
        HttpRequest {
            method: cfg.method.to_uppercase(),
            url: render(call, &cfg.url, &bindings)?,
            headers: cfg
                .headers
                .iter()
                .map(|(k, v)| Ok((k.clone(), render(call, v, &bindings)?)))
                .collect::<Result<_, NodeError>>()?,
            body: cfg
                .body
                .as_ref()
                .map(|b| render_body(call, b, &bindings))
                .transpose()?,
            timeout: cfg.timeout_ms.map(Duration::from_millis),
        }
    };

    let client = call.ctx.services.http.resolve(cfg.client.as_deref())?;
    tracing::debug!(
        node_id = %call.node.id,
        method = %request.method,
        url = %request.url,
        client = cfg.client.as_deref().unwrap_or("default"),
        "http request"
    );

    let response = tokio::select! {
        biased;
        _ = call.cancel.cancelled() => return Err(NodeError::cancelled()),
        response = client.execute(request) => response?,
    };

    if cfg.fail_on_status && !response.is_success() {
        return Err(NodeError::new(
            ErrorKind::Http,
            format!("unexpected status {}", response.status),
        ));
    }

    Ok(Outcome::value(response.to_value()).meta("status", response.status))
}
