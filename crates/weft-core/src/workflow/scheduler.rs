//! Scope scheduler.
//!
//! [`run_scope`] drives the direct members of one scope (the top level, or
//! the body of a loop, retry, try/catch or timeout node) inside one
//! [`Frame`]. Members are visited in topological order:
//!
//! 1. A node is ready once every inbound edge is resolved. Any live edge
//!    runs it; all-dead inbound edges skip it, and skips cascade.
//! 2. Ready nodes run concurrently on a `JoinSet`. Leaf behaviors hold a
//!    worker permit (plus the permits of enclosing `parallel` scopes);
//!    scoped nodes hold none so bodies never starve their parent.
//! 3. Joins resolve inline. `any`/`first` joins fire as soon as a winning
//!    branch resolves and cancel the rest of their exclusive region.
//! 4. A failure aborts the scope unless it lies in the region of a join that
//!    has not resolved yet. Tolerated failures poison downstream nodes so the
//!    join can still report them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use weft_types::error::NodeError;
use weft_types::node::{JoinStrategy, NodeKind};
use weft_types::result::{NodeResult, NodeStatus};

use super::context::{ExecutionContext, FailureOrigin, Frame};
use super::nodes::{self, Inbound, NodeCall, Outcome};
use super::scoped;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a scope stopped early.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    /// `node_id` raised `error` and nothing in the scope tolerated it.
    #[error("node '{node_id}' failed: {error}")]
    Failed { node_id: String, error: NodeError },

    #[error("scope cancelled")]
    Cancelled,

    #[error("scheduler error: {0}")]
    Internal(String),
}

/// What a node task produced.
#[derive(Debug)]
pub struct Finished {
    pub result: NodeResult,
    /// Node that raised the error, when it is not `result.node_id` (a body
    /// node failing inside a retry, for example).
    pub origin: Option<String>,
}

impl Finished {
    pub fn new(result: NodeResult) -> Self {
        Self {
            result,
            origin: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

enum EdgeState {
    Waiting,
    Live(Value),
    Dead,
    Failed(FailureOrigin),
}

enum Step {
    Wait,
    Skip(Option<FailureOrigin>),
    Dispatch { input: Value, inbound: Vec<Inbound> },
    /// A join resolved without a task.
    Complete(NodeResult),
    /// A join failed on behalf of one of its branches.
    Fail(FailureOrigin),
}

enum Event {
    Cancelled,
    Joined(Option<Result<(usize, Finished), tokio::task::JoinError>>),
    Deadline(usize),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run every direct member of `scope` in `frame`.
pub fn run_scope(
    ctx: Arc<ExecutionContext>,
    frame: Arc<Frame>,
    scope: Option<usize>,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<(), ScopeError>> {
    async move {
        let mut run = ScopeRun::new(ctx, frame, scope, cancel);
        run.drive().await
    }
    .boxed()
}

struct ScopeRun {
    ctx: Arc<ExecutionContext>,
    frame: Arc<Frame>,
    scope: Option<usize>,
    cancel: CancellationToken,
    /// Members not yet dispatched or resolved, in topological order.
    pending: Vec<usize>,
    running: HashMap<usize, CancellationToken>,
    tasks: JoinSet<(usize, Finished)>,
    /// `any`/`first` joins among the members.
    regional_joins: Vec<usize>,
    /// Joins among the members that carry a timeout.
    timed_joins: Vec<(usize, u64)>,
    deadlines: HashMap<usize, Instant>,
}

impl ScopeRun {
    fn new(
        ctx: Arc<ExecutionContext>,
        frame: Arc<Frame>,
        scope: Option<usize>,
        cancel: CancellationToken,
    ) -> Self {
        let pending = ctx.plan.members(scope).to_vec();
        let mut regional_joins = Vec::new();
        let mut timed_joins = Vec::new();
        for &m in &pending {
            if let NodeKind::Join(cfg) = &ctx.plan.node(m).kind {
                if cfg.strategy != JoinStrategy::All {
                    regional_joins.push(m);
                }
                if let Some(ms) = cfg.timeout_ms {
                    timed_joins.push((m, ms));
                }
            }
        }

        Self {
            ctx,
            frame,
            scope,
            cancel,
            pending,
            running: HashMap::new(),
            tasks: JoinSet::new(),
            regional_joins,
            timed_joins,
            deadlines: HashMap::new(),
        }
    }

    async fn drive(&mut self) -> Result<(), ScopeError> {
        loop {
            if self.cancel.is_cancelled() {
                self.abort().await;
                return Err(ScopeError::Cancelled);
            }
            if let Err(failure) = self.settle() {
                self.abort().await;
                return Err(failure);
            }
            if self.tasks.is_empty() {
                if self.pending.is_empty() {
                    return Ok(());
                }
                let stuck = self.ctx.plan.id(self.pending[0]).to_string();
                self.abort().await;
                return Err(ScopeError::Internal(format!(
                    "node '{stuck}' can never become ready"
                )));
            }

            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some((join, at)) => {
                        tokio::time::sleep_until(at).await;
                        join
                    }
                    None => std::future::pending().await,
                }
            };

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                joined = self.tasks.join_next() => Event::Joined(joined),
                join = timer => Event::Deadline(join),
            };

            let handled = match event {
                Event::Cancelled | Event::Joined(None) => Ok(()),
                Event::Joined(Some(Ok((idx, finished)))) => self.complete(idx, finished),
                Event::Joined(Some(Err(err))) => {
                    Err(ScopeError::Internal(format!("node task failed: {err}")))
                }
                Event::Deadline(join) => self.join_timed_out(join),
            };
            if let Err(failure) = handled {
                self.abort().await;
                return Err(failure);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Settling
    // -----------------------------------------------------------------------

    /// Resolve every member that can be resolved without waiting.
    fn settle(&mut self) -> Result<(), ScopeError> {
        let mut cursor = 0;
        while cursor < self.pending.len() {
            let idx = self.pending[cursor];
            let step = self.readiness(idx);
            if matches!(step, Step::Wait) {
                cursor += 1;
                continue;
            }
            self.pending.remove(cursor);
            let before = self.pending.len();
            self.apply(idx, step)?;
            // A join cancelled part of its region, which sits earlier in
            // topological order.
            if self.pending.len() != before {
                cursor = 0;
            }
        }
        Ok(())
    }

    fn apply(&mut self, idx: usize, step: Step) -> Result<(), ScopeError> {
        match step {
            Step::Wait => Ok(()),
            Step::Skip(poison) => {
                tracing::debug!(
                    run_id = %self.ctx.run_id,
                    node_id = self.ctx.plan.id(idx),
                    poisoned = poison.is_some(),
                    "skipping node"
                );
                self.skip(idx, poison);
                Ok(())
            }
            Step::Dispatch { input, inbound } => {
                self.dispatch(idx, input, inbound);
                Ok(())
            }
            Step::Complete(result) => {
                self.close_join(idx);
                self.frame.record(idx, result, None);
                Ok(())
            }
            Step::Fail((origin, error)) => {
                self.close_join(idx);
                let node = self.ctx.plan.node(idx);
                let result = NodeResult::failed(&node.id, node.type_name(), error);
                self.fail(
                    idx,
                    Finished {
                        result,
                        origin: Some(origin),
                    },
                )
            }
        }
    }

    fn edge_state(&self, e: usize) -> EdgeState {
        let plan = &self.ctx.plan;
        let src = plan.source(e);
        if let Some(entry) = self.frame.entry_value(src) {
            return EdgeState::Live(entry);
        }

        match self.frame.state(src) {
            None | Some(NodeStatus::Pending) | Some(NodeStatus::Running) => EdgeState::Waiting,
            Some(NodeStatus::Completed) => {
                let Some(result) = self.frame.result(src) else {
                    return EdgeState::Dead;
                };
                let edge = plan.edge(e);
                let live = match &result.selected_handles {
                    None => true,
                    Some(selected) => match edge.source_handle.as_deref() {
                        Some(handle) => selected.iter().any(|s| s == handle),
                        None => !plan.node(src).kind.is_branching(),
                    },
                };
                if live {
                    EdgeState::Live(
                        result
                            .value_for_handle(edge.source_handle.as_deref())
                            .clone(),
                    )
                } else {
                    EdgeState::Dead
                }
            }
            Some(NodeStatus::Failed) => EdgeState::Failed(self.frame.failure(src).unwrap_or_else(
                || {
                    (
                        plan.id(src).to_string(),
                        NodeError::invocation("upstream node failed"),
                    )
                },
            )),
            Some(NodeStatus::Skipped) => match self.frame.failure(src) {
                Some(poison) => EdgeState::Failed(poison),
                None => EdgeState::Dead,
            },
            Some(NodeStatus::Cancelled) => EdgeState::Dead,
        }
    }

    fn port_key(&self, e: usize) -> String {
        let edge = self.ctx.plan.edge(e);
        edge.target_handle
            .clone()
            .unwrap_or_else(|| edge.source.clone())
    }

    /// Node input from its live inbound edges: the bare value for a single
    /// unnamed edge, otherwise a map keyed by port.
    fn assemble(&self, live: Vec<(usize, Value)>) -> (Value, Vec<Inbound>) {
        let bare = match live.as_slice() {
            [(e, value)] if self.ctx.plan.edge(*e).target_handle.is_none() => Some(value.clone()),
            _ => None,
        };
        let inbound: Vec<Inbound> = live
            .into_iter()
            .map(|(e, value)| Inbound {
                key: self.port_key(e),
                value,
            })
            .collect();
        let input = bare.unwrap_or_else(|| {
            Value::Object(
                inbound
                    .iter()
                    .map(|i| (i.key.clone(), i.value.clone()))
                    .collect(),
            )
        });
        (input, inbound)
    }

    fn readiness(&self, idx: usize) -> Step {
        let plan = &self.ctx.plan;
        let incoming = plan.incoming(idx);
        if incoming.is_empty() {
            return Step::Dispatch {
                input: self.ctx.input.clone(),
                inbound: Vec::new(),
            };
        }
        if let NodeKind::Join(cfg) = &plan.node(idx).kind {
            return self.join_readiness(idx, cfg.strategy);
        }

        let mut live = Vec::new();
        let mut poison = None;
        for &e in incoming {
            match self.edge_state(e) {
                EdgeState::Waiting => return Step::Wait,
                EdgeState::Live(value) => live.push((e, value)),
                EdgeState::Dead => {}
                EdgeState::Failed(origin) => {
                    poison.get_or_insert(origin);
                }
            }
        }

        if poison.is_some() {
            return Step::Skip(poison);
        }
        if live.is_empty() {
            return Step::Skip(None);
        }
        let (input, inbound) = self.assemble(live);
        Step::Dispatch { input, inbound }
    }

    fn join_readiness(&self, join: usize, strategy: JoinStrategy) -> Step {
        let plan = &self.ctx.plan;
        let mut waiting = false;
        let mut live: Vec<(u64, usize, Value)> = Vec::new();
        let mut failures: Vec<(u64, FailureOrigin)> = Vec::new();
        for &e in plan.incoming(join) {
            let seq = self.frame.resolution(plan.source(e));
            match self.edge_state(e) {
                EdgeState::Waiting => waiting = true,
                EdgeState::Live(value) => live.push((seq, e, value)),
                EdgeState::Dead => {}
                EdgeState::Failed(origin) => failures.push((seq, origin)),
            }
        }
        let earliest_failure = failures.into_iter().min_by_key(|(seq, _)| *seq);

        match strategy {
            JoinStrategy::All => {
                if waiting {
                    return Step::Wait;
                }
                if let Some((_, origin)) = earliest_failure {
                    return Step::Fail(origin);
                }
                if live.is_empty() {
                    return Step::Skip(None);
                }
                let branches = live.len();
                let (_, inbound) =
                    self.assemble(live.into_iter().map(|(_, e, v)| (e, v)).collect());
                let output = Value::Object(
                    inbound
                        .into_iter()
                        .map(|i| (i.key, i.value))
                        .collect::<Map<String, Value>>(),
                );
                let mut result = self.join_result(join, output, "all");
                result
                    .metadata
                    .insert("branches".to_string(), Value::from(branches));
                Step::Complete(result)
            }
            JoinStrategy::Any | JoinStrategy::First => {
                let winner = live.into_iter().min_by_key(|(seq, _, _)| *seq);
                if strategy == JoinStrategy::First {
                    if let Some((failed_at, origin)) = &earliest_failure {
                        if winner.as_ref().is_none_or(|(seq, _, _)| failed_at < seq) {
                            return Step::Fail(origin.clone());
                        }
                    }
                }
                if let Some((_, e, value)) = winner {
                    let label = if strategy == JoinStrategy::Any { "any" } else { "first" };
                    let mut result = self.join_result(join, value, label);
                    result
                        .metadata
                        .insert("winner".to_string(), Value::from(self.port_key(e)));
                    return Step::Complete(result);
                }
                if waiting {
                    return Step::Wait;
                }
                match earliest_failure {
                    Some((_, origin)) => Step::Fail(origin),
                    None => Step::Skip(None),
                }
            }
        }
    }

    fn join_result(&self, join: usize, output: Value, strategy: &str) -> NodeResult {
        let node = self.ctx.plan.node(join);
        let mut result = NodeResult::completed(&node.id, node.type_name(), output);
        result.started_at = Some(Utc::now());
        result
            .metadata
            .insert("strategy".to_string(), Value::from(strategy));
        result
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn skip(&self, idx: usize, poison: Option<FailureOrigin>) {
        self.frame.skip(idx, poison);
        if let Some(body) = self.ctx.plan.body(idx) {
            for &n in &body.nodes {
                self.frame.skip(n, None);
            }
        }
    }

    fn mark_cancelled(&self, idx: usize) {
        self.frame.set_state(idx, NodeStatus::Cancelled);
        if let Some(body) = self.ctx.plan.body(idx) {
            for &n in &body.nodes {
                if !self.frame.state(n).is_some_and(NodeStatus::is_terminal) {
                    self.frame.set_state(n, NodeStatus::Cancelled);
                }
            }
        }
    }

    fn dispatch(&mut self, idx: usize, input: Value, inbound: Vec<Inbound>) {
        let ctx = Arc::clone(&self.ctx);
        let node = ctx.plan.node(idx);
        tracing::debug!(
            run_id = %ctx.run_id,
            node_id = %node.id,
            node_type = node.type_name(),
            "dispatching node"
        );
        self.frame.set_state(idx, NodeStatus::Running);
        self.arm_deadlines(idx);

        let token = self.cancel.child_token();
        self.running.insert(idx, token.clone());

        let frame = Arc::clone(&self.frame);
        let (node_id, node_type) = (node.id.clone(), node.type_name());
        let is_scoped = node.kind.is_scoped();
        let work: BoxFuture<'static, Finished> = if is_scoped {
            scoped::run(ctx, frame, idx, input, token).boxed()
        } else {
            run_leaf(ctx, frame, idx, input, inbound, token).boxed()
        };

        self.tasks.spawn(async move {
            let finished = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(finished) => finished,
                Err(_) => Finished::new(NodeResult::failed(
                    node_id,
                    node_type,
                    NodeError::invocation("node behavior panicked"),
                )),
            };
            (idx, finished)
        });
    }

    fn complete(&mut self, idx: usize, finished: Finished) -> Result<(), ScopeError> {
        self.running.remove(&idx);
        if self.frame.own_state(idx) == Some(NodeStatus::Cancelled) {
            return Ok(());
        }
        if self.cancel.is_cancelled() && finished.result.status != NodeStatus::Completed {
            self.mark_cancelled(idx);
            return Ok(());
        }

        match finished.result.status {
            NodeStatus::Failed => self.fail(idx, finished),
            _ => {
                tracing::debug!(
                    run_id = %self.ctx.run_id,
                    node_id = %finished.result.node_id,
                    duration_ms = finished.result.duration_ms,
                    "node completed"
                );
                self.frame.record(idx, finished.result, None);
                Ok(())
            }
        }
    }

    /// Record a failure and decide whether the scope survives it.
    fn fail(&mut self, idx: usize, finished: Finished) -> Result<(), ScopeError> {
        let origin = finished
            .origin
            .clone()
            .unwrap_or_else(|| finished.result.node_id.clone());
        let error = finished
            .result
            .error
            .clone()
            .unwrap_or_else(|| NodeError::invocation("node failed without an error"));
        self.frame.record(idx, finished.result, Some(&origin));

        if self.tolerated(idx) {
            tracing::debug!(
                run_id = %self.ctx.run_id,
                node_id = self.ctx.plan.id(idx),
                error = %error,
                "failure held for pending join"
            );
            return Ok(());
        }
        tracing::warn!(
            run_id = %self.ctx.run_id,
            node_id = origin.as_str(),
            kind = %error.kind,
            error = %error.message,
            "node failed"
        );
        Err(ScopeError::Failed {
            node_id: origin,
            error,
        })
    }

    fn tolerated(&self, idx: usize) -> bool {
        self.regional_joins.iter().any(|&j| {
            let open = !self.frame.own_state(j).is_some_and(NodeStatus::is_terminal);
            open && self
                .ctx
                .plan
                .join_region(j)
                .is_some_and(|r| r.region.contains(&idx))
        })
    }

    /// Cancel whatever is still unresolved in a resolved join's region.
    fn close_join(&mut self, join: usize) {
        self.deadlines.remove(&join);
        let ctx = Arc::clone(&self.ctx);
        let Some(region) = ctx.plan.join_region(join) else {
            return;
        };
        for &r in &region.region {
            if self.frame.own_state(r).is_some_and(NodeStatus::is_terminal) {
                continue;
            }
            if let Some(token) = self.running.remove(&r) {
                token.cancel();
            }
            self.pending.retain(|&p| p != r);
            tracing::debug!(
                run_id = %ctx.run_id,
                node_id = ctx.plan.id(r),
                join = ctx.plan.id(join),
                "cancelling losing branch"
            );
            self.mark_cancelled(r);
        }
    }

    // -----------------------------------------------------------------------
    // Join timeouts
    // -----------------------------------------------------------------------

    fn watches(&self, join: usize, idx: usize) -> bool {
        let plan = &self.ctx.plan;
        match plan.join_region(join) {
            Some(region) => region.watch.contains(&idx),
            None => plan.incoming(join).iter().any(|&e| plan.source(e) == idx),
        }
    }

    fn arm_deadlines(&mut self, idx: usize) {
        for i in 0..self.timed_joins.len() {
            let (join, ms) = self.timed_joins[i];
            if self.deadlines.contains_key(&join)
                || self.frame.own_state(join).is_some_and(NodeStatus::is_terminal)
                || !self.watches(join, idx)
            {
                continue;
            }
            self.deadlines
                .insert(join, Instant::now() + Duration::from_millis(ms));
        }
    }

    fn next_deadline(&self) -> Option<(usize, Instant)> {
        self.deadlines
            .iter()
            .map(|(&join, &at)| (join, at))
            .min_by_key(|&(_, at)| at)
    }

    fn join_timed_out(&mut self, join: usize) -> Result<(), ScopeError> {
        self.deadlines.remove(&join);
        if self.frame.own_state(join).is_some_and(NodeStatus::is_terminal) {
            return Ok(());
        }
        let ms = self
            .timed_joins
            .iter()
            .find(|(j, _)| *j == join)
            .map_or(0, |(_, ms)| *ms);
        let ctx = Arc::clone(&self.ctx);
        let node = ctx.plan.node(join);
        tracing::warn!(run_id = %ctx.run_id, node_id = %node.id, timeout_ms = ms, "join timed out");

        self.pending.retain(|&p| p != join);
        self.close_join(join);
        let error = NodeError::timeout(format!("join '{}' timed out after {ms}ms", node.id));
        let result = NodeResult::failed(&node.id, node.type_name(), error);
        self.fail(join, Finished::new(result))
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    /// Cancel in-flight work, wait for it, and mark everything unresolved as
    /// cancelled.
    async fn abort(&mut self) {
        for (_, token) in self.running.drain() {
            token.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            let Ok((idx, finished)) = joined else {
                continue;
            };
            if self.frame.own_state(idx) == Some(NodeStatus::Cancelled) {
                continue;
            }
            if finished.result.status == NodeStatus::Completed {
                self.frame.record(idx, finished.result, None);
            } else {
                self.mark_cancelled(idx);
            }
        }
        for idx in std::mem::take(&mut self.pending) {
            self.mark_cancelled(idx);
        }
        if let Some(scope) = self.scope {
            tracing::debug!(
                run_id = %self.ctx.run_id,
                scope = self.ctx.plan.id(scope),
                "scope aborted"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Leaf execution
// ---------------------------------------------------------------------------

async fn acquire(
    limit: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, NodeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NodeError::cancelled()),
        permit = Arc::clone(limit).acquire_owned() => {
            permit.map_err(|_| NodeError::resource("worker pool is closed"))
        }
    }
}

async fn invoke_leaf(
    ctx: &ExecutionContext,
    frame: &Frame,
    idx: usize,
    input: Value,
    inbound: Vec<Inbound>,
    cancel: &CancellationToken,
) -> Result<Outcome, NodeError> {
    // Parallel permits first, outermost scope first; the worker permit last.
    let mut _limits = Vec::new();
    for &p in ctx.plan.parallel_scopes(idx) {
        if let Some(limit) = ctx.parallel_limit(p) {
            _limits.push(acquire(limit, cancel).await?);
        }
    }
    let _worker = acquire(&ctx.services.workers, cancel).await?;

    let node = ctx.plan.node(idx);
    let call = NodeCall {
        ctx,
        frame,
        idx,
        node,
        input,
        inbound,
        cancel,
    };
    let guarded = async {
        match ctx.services.config.default_node_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), nodes::invoke(&call))
                .await
                .map_err(|_| {
                    NodeError::timeout(format!("node '{}' exceeded {ms}ms", node.id))
                })?,
            None => nodes::invoke(&call).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NodeError::cancelled()),
        outcome = guarded => outcome,
    }
}

async fn run_leaf(
    ctx: Arc<ExecutionContext>,
    frame: Arc<Frame>,
    idx: usize,
    input: Value,
    inbound: Vec<Inbound>,
    cancel: CancellationToken,
) -> Finished {
    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = invoke_leaf(&ctx, &frame, idx, input, inbound, &cancel).await;

    let node = ctx.plan.node(idx);
    let mut result = match outcome {
        Ok(outcome) => {
            let mut result = NodeResult::completed(&node.id, node.type_name(), outcome.output);
            result.handle_outputs = outcome.handle_outputs;
            result.selected_handles = outcome.selected_handles;
            result.metadata = outcome.metadata;
            result
        }
        Err(error) => NodeResult::failed(&node.id, node.type_name(), error),
    };
    result.started_at = Some(started_at);
    result.duration_ms = clock.elapsed().as_millis() as u64;
    Finished::new(result)
}
