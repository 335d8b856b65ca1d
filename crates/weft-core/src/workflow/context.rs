//! Per-run state.
//!
//! An [`ExecutionContext`] is created fresh for every run and dropped when the
//! run ends. Node results live in [`Frame`]s: the run has a root frame and
//! every loop iteration (or retry attempt, try/catch or timeout body) gets a
//! child frame. Lookups walk from the innermost frame outward, so a body node
//! sees its siblings from the current iteration and everything recorded
//! before the scope started.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::error::NodeError;
use weft_types::node::NodeKind;
use weft_types::result::{NodeResult, NodeStatus};

use crate::expression::{Bindings, ExpressionEvaluator};
use crate::http::HttpClientRegistry;
use crate::storage::{BoxCacheStore, BoxVariableStore};

use super::graph::ExecutionPlan;

// ---------------------------------------------------------------------------
// Engine services
// ---------------------------------------------------------------------------

/// Engine-owned collaborators shared by every run.
pub struct Services {
    pub config: EngineConfig,
    pub evaluator: ExpressionEvaluator,
    pub cache: BoxCacheStore,
    pub globals: BoxVariableStore,
    pub http: HttpClientRegistry,
    /// Bounds concurrently executing leaf behaviors across all runs.
    pub workers: Arc<Semaphore>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of one run.
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub plan: Arc<ExecutionPlan>,
    pub services: Arc<Services>,
    /// The run input.
    pub input: Value,
    /// Values injected by the caller, readable as `context.<name>`.
    pub context: Map<String, Value>,
    pub root: Arc<Frame>,
    variables: DashMap<String, Value>,
    locals: DashMap<(usize, String), Value>,
    counters: DashMap<String, i64>,
    accumulators: DashMap<usize, Value>,
    parallel: HashMap<usize, Arc<Semaphore>>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        plan: Arc<ExecutionPlan>,
        services: Arc<Services>,
        input: Value,
        context: Map<String, Value>,
    ) -> Self {
        let parallel = plan
            .order()
            .iter()
            .filter_map(|&i| match &plan.node(i).kind {
                NodeKind::Parallel(cfg) => cfg
                    .max_concurrency
                    .map(|permits| (i, Arc::new(Semaphore::new(permits.max(1))))),
                _ => None,
            })
            .collect();

        Self {
            run_id,
            plan,
            services,
            input,
            context,
            root: Arc::new(Frame::root()),
            variables: DashMap::new(),
            locals: DashMap::new(),
            counters: DashMap::new(),
            accumulators: DashMap::new(),
            parallel,
        }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.services.evaluator
    }

    /// Concurrency limiter of a `parallel` node, if it sets one.
    pub fn parallel_limit(&self, parallel: usize) -> Option<&Arc<Semaphore>> {
        self.parallel.get(&parallel)
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.value().clone())
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn local(&self, node: usize, name: &str) -> Option<Value> {
        self.locals
            .get(&(node, name.to_string()))
            .map(|v| v.value().clone())
    }

    pub fn set_local(&self, node: usize, name: &str, value: Value) {
        self.locals.insert((node, name.to_string()), value);
    }

    /// `variables` as seen by `node`: workflow scope overlaid with the
    /// node's own local slots.
    pub fn variables_view(&self, node: usize) -> Value {
        let mut view: Map<String, Value> = self
            .variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for entry in self.locals.iter().filter(|e| e.key().0 == node) {
            view.insert(entry.key().1.clone(), entry.value().clone());
        }
        Value::Object(view)
    }

    // -----------------------------------------------------------------------
    // Counters and accumulators
    // -----------------------------------------------------------------------

    /// Atomically apply `f` to a run-scoped counter and return the new value.
    pub fn update_counter(&self, name: &str, f: impl FnOnce(Option<i64>) -> i64) -> i64 {
        match self.counters.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = f(Some(*entry.get()));
                entry.insert(next);
                next
            }
            Entry::Vacant(entry) => *entry.insert(f(None)),
        }
    }

    pub fn counter(&self, name: &str) -> Option<i64> {
        self.counters.get(name).map(|v| *v.value())
    }

    /// Atomically fold a value into an accumulator's state.
    pub fn accumulate<E>(
        &self,
        node: usize,
        f: impl FnOnce(Option<&Value>) -> Result<Value, E>,
    ) -> Result<Value, E> {
        match self.accumulators.entry(node) {
            Entry::Occupied(mut entry) => {
                let next = f(Some(entry.get()))?;
                entry.insert(next.clone());
                Ok(next)
            }
            Entry::Vacant(entry) => {
                let next = f(None)?;
                entry.insert(next.clone());
                Ok(next)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Where a failure came from: the node that raised it and the error.
pub type FailureOrigin = (String, NodeError);

/// Result and state storage for one scope invocation.
#[derive(Default)]
pub struct Frame {
    parent: Option<Arc<Frame>>,
    /// The scoped node that opened this frame and the value its body edges carry.
    entry: Option<(usize, Value)>,
    /// Names such as `item`, `index` and `acc`.
    names: Vec<(&'static str, Value)>,
    results: DashMap<usize, Arc<NodeResult>>,
    states: DashMap<usize, NodeStatus>,
    failures: DashMap<usize, FailureOrigin>,
    resolved: DashMap<usize, u64>,
    seq: AtomicU64,
}

impl Frame {
    pub fn root() -> Self {
        Self::default()
    }

    /// A frame for one invocation of `scoped`'s body.
    pub fn child(
        parent: &Arc<Frame>,
        scoped: usize,
        entry: Value,
        names: Vec<(&'static str, Value)>,
    ) -> Self {
        Self {
            parent: Some(Arc::clone(parent)),
            entry: Some((scoped, entry)),
            names,
            ..Self::default()
        }
    }

    fn chain(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(self), |f| f.parent.as_deref())
    }

    pub fn state(&self, idx: usize) -> Option<NodeStatus> {
        self.chain().find_map(|f| f.states.get(&idx).map(|s| *s.value()))
    }

    /// State recorded in this frame only.
    pub fn own_state(&self, idx: usize) -> Option<NodeStatus> {
        self.states.get(&idx).map(|s| *s.value())
    }

    pub fn result(&self, idx: usize) -> Option<Arc<NodeResult>> {
        self.chain()
            .find_map(|f| f.results.get(&idx).map(|r| Arc::clone(r.value())))
    }

    pub fn failure(&self, idx: usize) -> Option<FailureOrigin> {
        self.chain()
            .find_map(|f| f.failures.get(&idx).map(|r| r.value().clone()))
    }

    /// Value carried by body edges leaving `scoped`, if a frame in the chain
    /// was opened by it.
    pub fn entry_value(&self, scoped: usize) -> Option<Value> {
        self.chain().find_map(|f| match &f.entry {
            Some((s, v)) if *s == scoped => Some(v.clone()),
            _ => None,
        })
    }

    pub fn binding(&self, name: &str) -> Option<Value> {
        self.chain().find_map(|f| {
            f.names
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
        })
    }

    /// Order in which `idx` reached a terminal state in this frame. Nodes
    /// resolved outside this frame sort first.
    pub fn resolution(&self, idx: usize) -> u64 {
        self.resolved.get(&idx).map_or(0, |s| *s.value())
    }

    pub fn set_state(&self, idx: usize, state: NodeStatus) {
        self.states.insert(idx, state);
        if state.is_terminal() {
            self.resolved
                .entry(idx)
                .or_insert_with(|| self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        }
    }

    /// Record a result and its status. Failed results also record `origin`.
    pub fn record(&self, idx: usize, result: NodeResult, origin: Option<&str>) {
        if let (NodeStatus::Failed, Some(error)) = (result.status, &result.error) {
            let origin = origin.unwrap_or(&result.node_id).to_string();
            self.failures.insert(idx, (origin, error.clone()));
        }
        self.set_state(idx, result.status);
        self.results.insert(idx, Arc::new(result));
    }

    /// Mark `idx` skipped. `poison` carries a tolerated upstream failure so
    /// consumers further down can still report it.
    pub fn skip(&self, idx: usize, poison: Option<FailureOrigin>) {
        if let Some(poison) = poison {
            self.failures.insert(idx, poison);
        }
        self.set_state(idx, NodeStatus::Skipped);
    }

    /// Copy everything recorded in `child` into this frame.
    pub fn absorb(&self, child: &Frame) {
        for r in child.results.iter() {
            self.results.insert(*r.key(), Arc::clone(r.value()));
        }
        for f in child.failures.iter() {
            self.failures.insert(*f.key(), f.value().clone());
        }
        for s in child.states.iter() {
            self.set_state(*s.key(), *s.value());
        }
    }

    /// Results recorded in this frame.
    pub fn own_results(&self) -> Vec<Arc<NodeResult>> {
        self.results.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn own_states(&self) -> Vec<(usize, NodeStatus)> {
        self.states.iter().map(|s| (*s.key(), *s.value())).collect()
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Names visible to expressions evaluated by one node.
pub struct NodeBindings<'a> {
    pub ctx: &'a ExecutionContext,
    pub frame: &'a Frame,
    pub node: usize,
    pub input: &'a Value,
}

impl Bindings for NodeBindings<'_> {
    fn root(&self, name: &str) -> Option<Value> {
        match name {
            "input" => Some(self.input.clone()),
            "variables" => Some(self.ctx.variables_view(self.node)),
            "context" => Some(Value::Object(self.ctx.context.clone())),
            other => self.frame.binding(other),
        }
    }

    fn node_field(&self, node_id: &str, field: &str) -> Option<Value> {
        let idx = self.ctx.plan.index_of(node_id)?;
        let result = self.frame.result(idx)?;
        match field {
            "output" => Some(result.output.clone()),
            "metadata" => Some(Value::Object(result.metadata.clone())),
            "status" => serde_json::to_value(result.status).ok(),
            "error" => Some(
                result
                    .error
                    .as_ref()
                    .and_then(|e| serde_json::to_value(e).ok())
                    .unwrap_or(Value::Null),
            ),
            "attempts" => Some(Value::from(result.attempts)),
            _ => None,
        }
    }
}
