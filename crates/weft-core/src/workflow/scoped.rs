//! Nodes that run a body: for_each, while_loop, retry, try_catch, timeout.
//!
//! Every body invocation gets its own child [`Frame`] so iterations and
//! attempts never see each other's results. The last invocation's frame is
//! copied into the parent once the node finishes.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_types::error::NodeError;
use weft_types::node::{
    ForEachConfig, NodeKind, RetryConfig, TimeoutAction, TimeoutConfig, TryCatchConfig,
    WhileLoopConfig,
};
use weft_types::result::{NodeResult, NodeStatus};
use weft_types::workflow::{HANDLE_ERROR, HANDLE_SUCCESS, Node};

use crate::expression::{Scoped, kind_name};

use super::context::{ExecutionContext, Frame, NodeBindings};
use super::retry::RetryHandler;
use super::scheduler::{Finished, ScopeError, run_scope};

/// Run the scoped node `idx` and its body.
pub async fn run(
    ctx: Arc<ExecutionContext>,
    frame: Arc<Frame>,
    idx: usize,
    input: Value,
    cancel: CancellationToken,
) -> Finished {
    let started_at = Utc::now();
    let clock = Instant::now();
    let node = ctx.plan.node(idx);
    let scope = Scope {
        ctx: &ctx,
        frame: &frame,
        idx,
        node,
        cancel: &cancel,
    };

    let mut finished = match &node.kind {
        NodeKind::ForEach(cfg) => scope.for_each(cfg, input).await,
        NodeKind::WhileLoop(cfg) => scope.while_loop(cfg, input).await,
        NodeKind::Retry(cfg) => scope.retry(cfg, input).await,
        NodeKind::TryCatch(cfg) => scope.try_catch(cfg, input).await,
        NodeKind::Timeout(cfg) => scope.timeout(cfg, input).await,
        _ => scope.fail(NodeError::invocation(format!(
            "'{}' has no body to run",
            node.type_name()
        ))),
    };
    finished.result.started_at = Some(started_at);
    finished.result.duration_ms = clock.elapsed().as_millis() as u64;
    finished
}

struct Scope<'a> {
    ctx: &'a Arc<ExecutionContext>,
    frame: &'a Arc<Frame>,
    idx: usize,
    node: &'a Node,
    cancel: &'a CancellationToken,
}

impl Scope<'_> {
    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn completed(&self, output: Value) -> NodeResult {
        NodeResult::completed(&self.node.id, self.node.type_name(), output)
    }

    fn fail(&self, error: NodeError) -> Finished {
        Finished::new(NodeResult::failed(
            &self.node.id,
            self.node.type_name(),
            error,
        ))
    }

    fn scope_failed(&self, err: ScopeError) -> Finished {
        match err {
            ScopeError::Failed { node_id, error } => Finished {
                result: NodeResult::failed(&self.node.id, self.node.type_name(), error),
                origin: Some(node_id),
            },
            ScopeError::Cancelled => self.fail(NodeError::cancelled()),
            ScopeError::Internal(message) => self.fail(NodeError::invocation(message)),
        }
    }

    fn bindings<'b>(&'b self, input: &'b Value) -> NodeBindings<'b> {
        NodeBindings {
            ctx: self.ctx,
            frame: self.frame,
            node: self.idx,
            input,
        }
    }

    /// Iteration ceiling: the node's own value, clamped to the engine's.
    fn ceiling(&self, configured: Option<u32>) -> u32 {
        let engine = self.ctx.services.config.loop_ceiling();
        match configured {
            Some(n) if n > engine => {
                tracing::warn!(
                    run_id = %self.ctx.run_id,
                    node_id = %self.node.id,
                    configured = n,
                    ceiling = engine,
                    "loop ceiling clamped to engine limit"
                );
                engine
            }
            Some(n) => n,
            None => engine,
        }
    }

    async fn run_body(
        &self,
        entry: Value,
        names: Vec<(&'static str, Value)>,
        cancel: &CancellationToken,
    ) -> (Arc<Frame>, Result<(), ScopeError>) {
        let child = Arc::new(Frame::child(self.frame, self.idx, entry, names));
        let outcome = run_scope(
            Arc::clone(self.ctx),
            Arc::clone(&child),
            Some(self.idx),
            cancel.clone(),
        )
        .await;
        (child, outcome)
    }

    /// Value of one body invocation: the completed terminal's output, or a
    /// map of terminal id to output when several completed.
    fn body_value(&self, child: &Frame) -> Value {
        let Some(body) = self.ctx.plan.body(self.idx) else {
            return Value::Null;
        };
        let mut done: Vec<(String, Value)> = body
            .terminals
            .iter()
            .filter(|&&t| child.own_state(t) == Some(NodeStatus::Completed))
            .filter_map(|&t| child.result(t))
            .map(|r| (r.node_id.clone(), r.output.clone()))
            .collect();
        match done.len() {
            0 => Value::Null,
            1 => done.pop().map_or(Value::Null, |(_, v)| v),
            _ => Value::Object(done.into_iter().collect()),
        }
    }

    fn skip_body(&self) {
        if let Some(body) = self.ctx.plan.body(self.idx) {
            for &n in &body.nodes {
                self.frame.skip(n, None);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn for_each(&self, cfg: &ForEachConfig, input: Value) -> Finished {
        let items = match cfg.items.as_deref() {
            Some(expr) => self
                .ctx
                .evaluator()
                .evaluate_for_node(expr, &self.bindings(&input)),
            None => Ok(input.clone()),
        };
        let items = match items {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                return self.fail(NodeError::evaluation(
                    format!("for_each expects an array, got {}", kind_name(&other)),
                    cfg.items.as_deref().unwrap_or("input"),
                ));
            }
            Err(error) => return self.fail(error),
        };

        let max_iterations = self.ceiling(cfg.max_iterations);
        if items.len() > max_iterations as usize {
            return self.fail(NodeError::resource(format!(
                "for_each '{}' has {} items, above its ceiling of {max_iterations}",
                self.node.id,
                items.len()
            )));
        }

        let iterations = items.len();
        let mut outputs = Vec::with_capacity(iterations);
        let mut last = None;
        for (index, item) in items.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return self.fail(NodeError::cancelled());
            }
            let names = vec![("item", item.clone()), ("index", Value::from(index))];
            let (child, outcome) = self.run_body(item, names, self.cancel).await;
            if let Err(err) = outcome {
                self.frame.absorb(&child);
                return self.scope_failed(err);
            }
            outputs.push(self.body_value(&child));
            last = Some(child);
        }

        match last {
            Some(child) => self.frame.absorb(&child),
            None => self.skip_body(),
        }
        let mut result = self.completed(Value::Array(outputs));
        result
            .metadata
            .insert("iterations".to_string(), Value::from(iterations));
        result
            .metadata
            .insert("max_iterations".to_string(), Value::from(max_iterations));
        Finished::new(result)
    }

    async fn while_loop(&self, cfg: &WhileLoopConfig, input: Value) -> Finished {
        let max_iterations = self.ceiling(cfg.max_iterations);
        let mut acc = Value::Null;
        let mut outputs = Vec::new();
        let mut last: Option<Arc<Frame>> = None;
        let mut index: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return self.fail(NodeError::cancelled());
            }
            let go = {
                let bindings = self.bindings(&input);
                let scoped = Scoped::new(&bindings)
                    .with("index", Value::from(index))
                    .with("acc", acc.clone());
                self.ctx
                    .evaluator()
                    .evaluate_bool_for_node(&cfg.condition, &scoped)
            };
            match go {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => return self.fail(error),
            }
            if index >= max_iterations {
                if let Some(child) = &last {
                    self.frame.absorb(child);
                }
                return self.fail(NodeError::resource(format!(
                    "while_loop '{}' still running after {max_iterations} iterations",
                    self.node.id
                )));
            }

            let names = vec![("index", Value::from(index)), ("acc", acc.clone())];
            let (child, outcome) = self.run_body(input.clone(), names, self.cancel).await;
            if let Err(err) = outcome {
                self.frame.absorb(&child);
                return self.scope_failed(err);
            }
            acc = self.body_value(&child);
            outputs.push(acc.clone());
            last = Some(child);
            index += 1;
        }

        match last {
            Some(child) => self.frame.absorb(&child),
            None => self.skip_body(),
        }
        let mut result = self.completed(Value::Array(outputs));
        result
            .metadata
            .insert("iterations".to_string(), Value::from(index));
        result
            .metadata
            .insert("max_iterations".to_string(), Value::from(max_iterations));
        Finished::new(result)
    }

    // -----------------------------------------------------------------------
    // Resilience
    // -----------------------------------------------------------------------

    async fn retry(&self, cfg: &RetryConfig, input: Value) -> Finished {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let names = vec![("attempt", Value::from(attempt))];
            let (child, outcome) = self.run_body(input.clone(), names, self.cancel).await;

            let mut finished = match outcome {
                Ok(()) => Finished::new(self.completed(self.body_value(&child))),
                Err(ScopeError::Failed { node_id, error })
                    if RetryHandler::should_retry(cfg, attempt, error.kind) =>
                {
                    let delay = RetryHandler::backoff_delay(cfg, attempt);
                    tracing::warn!(
                        run_id = %self.ctx.run_id,
                        node_id = %self.node.id,
                        failed_node = node_id.as_str(),
                        attempt,
                        max_attempts = cfg.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying body"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            self.frame.absorb(&child);
                            return self.fail(NodeError::cancelled());
                        }
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(err) => self.scope_failed(err),
            };

            self.frame.absorb(&child);
            finished.result.attempts = attempt;
            finished
                .result
                .metadata
                .insert("attempts".to_string(), Value::from(attempt));
            return finished;
        }
    }

    async fn try_catch(&self, cfg: &TryCatchConfig, input: Value) -> Finished {
        let (child, outcome) = self.run_body(input, Vec::new(), self.cancel).await;
        self.frame.absorb(&child);

        let (node_id, error) = match outcome {
            Ok(()) => {
                let mut result = self.completed(self.body_value(&child));
                result.selected_handles = Some(vec![HANDLE_SUCCESS.to_string()]);
                result
                    .metadata
                    .insert("caught".to_string(), Value::Bool(false));
                return Finished::new(result);
            }
            Err(ScopeError::Failed { node_id, error }) => (node_id, error),
            Err(err) => return self.scope_failed(err),
        };

        let catchable = cfg.continue_on_error
            && (!error.kind.is_resource() || cfg.catch_resource_errors)
            && !self.cancel.is_cancelled();
        if !catchable {
            return self.scope_failed(ScopeError::Failed { node_id, error });
        }

        let path = cfg
            .error_output_path
            .clone()
            .unwrap_or_else(|| HANDLE_ERROR.to_string());
        tracing::debug!(
            run_id = %self.ctx.run_id,
            node_id = %self.node.id,
            failed_node = node_id.as_str(),
            path = path.as_str(),
            "error caught"
        );
        let output = cfg.fallback_value.clone().unwrap_or_else(|| {
            json!({
                "error": error.message,
                "kind": error.kind,
                "node": node_id,
            })
        });

        let mut result = self.completed(output);
        result.error = Some(error);
        result.selected_handles = Some(vec![path.clone()]);
        result
            .metadata
            .insert("caught".to_string(), Value::Bool(true));
        result.metadata.insert("path".to_string(), Value::from(path));
        result
            .metadata
            .insert("failed_node".to_string(), Value::from(node_id));
        Finished::new(result)
    }

    async fn timeout(&self, cfg: &TimeoutConfig, input: Value) -> Finished {
        let body_cancel = self.cancel.child_token();
        let child = Arc::new(Frame::child(self.frame, self.idx, input, Vec::new()));
        let mut body = run_scope(
            Arc::clone(self.ctx),
            Arc::clone(&child),
            Some(self.idx),
            body_cancel.clone(),
        );

        let limit = std::time::Duration::from_millis(cfg.timeout_ms);
        let timed = tokio::time::timeout(limit, &mut body).await;
        let (outcome, timed_out) = match timed {
            Ok(outcome) => (outcome, false),
            Err(_) => {
                body_cancel.cancel();
                (body.await, true)
            }
        };
        self.frame.absorb(&child);

        if !timed_out {
            let mut finished = match outcome {
                Ok(()) => Finished::new(self.completed(self.body_value(&child))),
                Err(err) => self.scope_failed(err),
            };
            finished
                .result
                .metadata
                .insert("timed_out".to_string(), Value::Bool(false));
            finished
                .result
                .metadata
                .insert("used_partial".to_string(), Value::Bool(false));
            return finished;
        }

        tracing::warn!(
            run_id = %self.ctx.run_id,
            node_id = %self.node.id,
            timeout_ms = cfg.timeout_ms,
            action = ?cfg.timeout_action,
            "body timed out"
        );
        let mut finished = match cfg.timeout_action {
            TimeoutAction::Error => self.fail(NodeError::timeout(format!(
                "timeout '{}' expired after {}ms",
                self.node.id, cfg.timeout_ms
            ))),
            TimeoutAction::ContinueWithPartial => {
                let results: Map<String, Value> = child
                    .own_results()
                    .into_iter()
                    .filter(|r| r.status == NodeStatus::Completed)
                    .map(|r| (r.node_id.clone(), r.output.clone()))
                    .collect();
                Finished::new(self.completed(json!({
                    "partial": true,
                    "results": results,
                })))
            }
        };
        let used_partial = cfg.timeout_action == TimeoutAction::ContinueWithPartial;
        finished
            .result
            .metadata
            .insert("timed_out".to_string(), Value::Bool(true));
        finished
            .result
            .metadata
            .insert("used_partial".to_string(), Value::Bool(used_partial));
        finished
    }
}
