//! Workflow engine: validates a workflow, runs its top-level scope and builds
//! the run report.
//!
//! The engine owns the services shared by every run (configuration, the
//! expression cache, the cache and global variable stores, the HTTP client
//! registry and the worker pool). Each run gets a fresh
//! [`ExecutionContext`] and a cancellation token registered under its run id
//! so it can be cancelled from outside.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::config::{EngineConfig, SinkAggregation};
use weft_types::error::ErrorKind;
use weft_types::result::{NodeStatus, RunReport};
use weft_types::workflow::Workflow;

use crate::expression::ExpressionEvaluator;
use crate::http::HttpClientRegistry;
use crate::storage::{BoxCacheStore, BoxVariableStore, MemoryCacheStore, MemoryVariableStore};

use super::context::{ExecutionContext, Services};
use super::graph::ExecutionPlan;
use super::scheduler::{ScopeError, run_scope};
use super::validate::ValidationError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a run did not produce a report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("node '{node_id}' failed ({kind}): {message}")]
    NodeFailed {
        node_id: String,
        kind: ErrorKind,
        message: String,
        /// Source text of the expression that failed, for evaluation errors.
        expression: Option<String>,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("run exceeded its {0}ms deadline")]
    Timeout(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    /// The error kind callers can branch on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NodeFailed { kind, .. } => *kind,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Invocation,
        }
    }
}

impl From<ScopeError> for RunError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Failed { node_id, error } => Self::NodeFailed {
                node_id,
                kind: error.kind,
                message: error.message,
                expression: error.expression,
            },
            ScopeError::Cancelled => Self::Cancelled,
            ScopeError::Internal(message) => Self::Internal(message),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Run `workflow` once under the given run id.
    fn run_with_id(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        input: Value,
        context: Map<String, Value>,
    ) -> impl Future<Output = Result<RunReport, RunError>> + Send;

    /// Run `workflow` once under a fresh UUIDv7 run id.
    fn run(
        &self,
        workflow: &Workflow,
        input: Value,
        context: Map<String, Value>,
    ) -> impl Future<Output = Result<RunReport, RunError>> + Send {
        self.run_with_id(Uuid::now_v7(), workflow, input, context)
    }

    /// Cancel an in-flight run. Returns `false` when no such run is active.
    fn cancel(&self, run_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflows with shared services.
pub struct WorkflowEngine {
    services: Arc<Services>,
    /// Cancellation tokens keyed by run_id.
    runs: DashMap<Uuid, CancellationToken>,
}

impl WorkflowEngine {
    /// An engine with in-memory stores and no HTTP clients.
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            cache: None,
            globals: None,
            http: HttpClientRegistry::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Run ids currently executing.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|r| *r.key()).collect()
    }

    async fn execute(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        input: Value,
        context: Map<String, Value>,
    ) -> Result<RunReport, RunError> {
        let plan = ExecutionPlan::build(workflow)?;
        if let SinkAggregation::Named(name) = &self.services.config.sink_aggregation {
            let known = plan
                .index_of(name)
                .is_some_and(|i| plan.sinks().contains(&i));
            if !known {
                return Err(ValidationError::UnknownSink(name.clone()).into());
            }
        }

        let started_at = Utc::now();
        tracing::info!(
            run_id = %run_id,
            workflow_id = workflow.id.as_str(),
            nodes = plan.len(),
            "starting workflow run"
        );

        let ctx = Arc::new(ExecutionContext::new(
            run_id,
            Arc::new(plan),
            Arc::clone(&self.services),
            input,
            context,
        ));

        let cancel = CancellationToken::new();
        self.runs.insert(run_id, cancel.clone());
        let _registered = Registration {
            runs: &self.runs,
            run_id,
        };

        let mut scope = run_scope(
            Arc::clone(&ctx),
            Arc::clone(&ctx.root),
            None,
            cancel.clone(),
        );
        let outcome = match self.services.config.run_timeout_ms {
            Some(ms) => {
                let timed = tokio::time::timeout(Duration::from_millis(ms), &mut scope).await;
                match timed {
                    Ok(outcome) => outcome.map_err(RunError::from),
                    Err(_) => {
                        cancel.cancel();
                        let _ = scope.await;
                        Err(RunError::Timeout(ms))
                    }
                }
            }
            None => scope.await.map_err(RunError::from),
        };

        if let Err(err) = outcome {
            tracing::warn!(
                run_id = %run_id,
                workflow_id = workflow.id.as_str(),
                error = %err,
                "workflow run failed"
            );
            return Err(err);
        }

        let report = self.report(&ctx, started_at);
        tracing::info!(
            run_id = %run_id,
            workflow_id = workflow.id.as_str(),
            duration_ms = report.duration_ms(),
            "workflow run completed"
        );
        Ok(report)
    }

    fn report(&self, ctx: &ExecutionContext, started_at: chrono::DateTime<Utc>) -> RunReport {
        let plan = &ctx.plan;
        let results = ctx
            .root
            .own_results()
            .into_iter()
            .map(|r| (r.node_id.clone(), (*r).clone()))
            .collect();
        let node_states = (0..plan.len())
            .map(|i| {
                let state = ctx.root.own_state(i).unwrap_or(NodeStatus::Pending);
                (plan.id(i).to_string(), state)
            })
            .collect();

        RunReport {
            run_id: ctx.run_id,
            workflow_id: plan.workflow().id.clone(),
            output: self.aggregate(ctx),
            results,
            node_states,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Combine the values of completed sinks.
    fn aggregate(&self, ctx: &ExecutionContext) -> Value {
        let plan = &ctx.plan;
        let mut completed = plan.sinks().iter().filter_map(|&s| {
            (ctx.root.own_state(s) == Some(NodeStatus::Completed))
                .then(|| ctx.root.result(s))
                .flatten()
        });

        match &self.services.config.sink_aggregation {
            SinkAggregation::First => completed.next().map_or(Value::Null, |r| r.output.clone()),
            SinkAggregation::Named(name) => completed
                .find(|r| &r.node_id == name)
                .map_or(Value::Null, |r| r.output.clone()),
            SinkAggregation::All => Value::Object(
                completed
                    .map(|r| (r.node_id.clone(), r.output.clone()))
                    .collect(),
            ),
        }
    }
}

impl WorkflowExecutor for WorkflowEngine {
    fn run_with_id(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        input: Value,
        context: Map<String, Value>,
    ) -> impl Future<Output = Result<RunReport, RunError>> + Send {
        self.execute(run_id, workflow, input, context)
    }

    fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "cancelling workflow run");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Removes a run's cancellation token when the run ends or is dropped.
struct Registration<'a> {
    runs: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

/// Wires the stores and HTTP clients an engine uses.
pub struct EngineBuilder {
    config: EngineConfig,
    cache: Option<BoxCacheStore>,
    globals: Option<BoxVariableStore>,
    http: HttpClientRegistry,
}

impl EngineBuilder {
    pub fn cache(mut self, cache: BoxCacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn variables(mut self, globals: BoxVariableStore) -> Self {
        self.globals = Some(globals);
        self
    }

    pub fn http(mut self, http: HttpClientRegistry) -> Self {
        self.http = http;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let services = Services {
            evaluator: ExpressionEvaluator::new(),
            cache: self
                .cache
                .unwrap_or_else(|| BoxCacheStore::new(MemoryCacheStore::new())),
            globals: self
                .globals
                .unwrap_or_else(|| BoxVariableStore::new(MemoryVariableStore::new())),
            http: self.http,
            workers,
            config: self.config,
        };
        WorkflowEngine {
            services: Arc::new(services),
            runs: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{BoxHttpExecutor, HttpError, HttpExecutor, HttpRequest, HttpResponse};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_types::node::*;
    use weft_types::workflow::{Edge, HANDLE_BODY, HANDLE_DEFAULT, Node};

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(EngineConfig::default())
    }

    fn engine_with(f: impl FnOnce(&mut EngineConfig)) -> WorkflowEngine {
        let mut config = EngineConfig::default();
        f(&mut config);
        WorkflowEngine::new(config)
    }

    async fn run(engine: &WorkflowEngine, workflow: &Workflow, input: Value) -> Result<RunReport, RunError> {
        engine.run(workflow, input, Map::new()).await
    }

    fn input(id: &str) -> Node {
        Node::new(id, NodeKind::Input(InputConfig::default()))
    }

    fn constant(id: &str, value: Value) -> Node {
        Node::new(id, NodeKind::Constant(ConstantConfig { value }))
    }

    fn output(id: &str, expression: &str) -> Node {
        Node::new(
            id,
            NodeKind::Output(OutputConfig {
                expression: Some(expression.to_string()),
            }),
        )
    }

    fn math(id: &str, operation: MathOperation, operand: i64) -> Node {
        Node::new(
            id,
            NodeKind::Math(MathConfig {
                operation,
                operand: Some(operand.into()),
            }),
        )
    }

    fn delay(id: &str, duration_ms: u64) -> Node {
        Node::new(id, NodeKind::Delay(DelayConfig { duration_ms }))
    }

    fn condition(id: &str, expression: &str) -> Node {
        Node::new(
            id,
            NodeKind::Condition(ConditionConfig {
                expression: expression.to_string(),
            }),
        )
    }

    fn for_each(id: &str, max_iterations: Option<u32>) -> Node {
        Node::new(
            id,
            NodeKind::ForEach(ForEachConfig {
                items: None,
                max_iterations,
            }),
        )
    }

    fn node_failed(err: RunError) -> (String, ErrorKind, Option<String>) {
        match err {
            RunError::NodeFailed {
                node_id,
                kind,
                expression,
                ..
            } => (node_id, kind, expression),
            other => panic!("expected a node failure, got {other:?}"),
        }
    }

    // -- Branching ----------------------------------------------------------

    fn age_check() -> Workflow {
        Workflow::new("age")
            .with_node(input("age"))
            .with_node(condition("check", "input >= 18"))
            .with_node(output("adult", "'adult'"))
            .with_node(output("minor", "'minor'"))
            .with_edge(Edge::new("age", "check"))
            .with_edge(Edge::from_handle("check", "true", "adult"))
            .with_edge(Edge::from_handle("check", "false", "minor"))
    }

    #[tokio::test]
    async fn test_condition_prunes_untaken_branch() {
        let engine = engine();
        let workflow = age_check();

        let report = run(&engine, &workflow, json!(18)).await.unwrap();
        assert_eq!(report.output, json!({"adult": "adult"}));
        assert_eq!(report.state("minor"), Some(NodeStatus::Skipped));
        assert!(report.result("minor").is_none());
        assert_eq!(report.result("check").unwrap().selected_path(), Some("true"));

        let report = run(&engine, &workflow, json!(17)).await.unwrap();
        assert_eq!(report.output, json!({"minor": "minor"}));
        assert_eq!(report.state("adult"), Some(NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_unlabeled_edge_from_condition_is_dead() {
        let workflow = Workflow::new("w")
            .with_node(condition("check", "true"))
            .with_node(constant("tail", json!(1)))
            .with_node(constant("taken", json!(2)))
            .with_edge(Edge::new("check", "tail"))
            .with_edge(Edge::from_handle("check", "true", "taken"));

        let report = run(&engine(), &workflow, Value::Null).await.unwrap();
        assert_eq!(report.state("tail"), Some(NodeStatus::Skipped));
        assert_eq!(report.output, json!({"taken": 2}));
    }

    #[tokio::test]
    async fn test_switch_uses_typed_equality_and_default() {
        let switch = Node::new(
            "route",
            NodeKind::Switch(SwitchConfig {
                field: None,
                cases: vec![
                    SwitchCase {
                        value: Some(json!(200)),
                        output_path: Some("ok".into()),
                        ..Default::default()
                    },
                    SwitchCase {
                        value: Some(json!(404)),
                        output_path: Some("missing".into()),
                        ..Default::default()
                    },
                    SwitchCase {
                        is_default: true,
                        ..Default::default()
                    },
                ],
            }),
        );
        let workflow = Workflow::new("status")
            .with_node(switch)
            .with_node(output("ok", "'ok'"))
            .with_node(output("missing", "'missing'"))
            .with_node(output("other", "'other'"))
            .with_edge(Edge::from_handle("route", "ok", "ok"))
            .with_edge(Edge::from_handle("route", "missing", "missing"))
            .with_edge(Edge::from_handle("route", HANDLE_DEFAULT, "other"));
        let engine = engine();

        let report = run(&engine, &workflow, json!(404)).await.unwrap();
        assert_eq!(report.output, json!({"missing": "missing"}));

        let report = run(&engine, &workflow, json!("404")).await.unwrap();
        assert_eq!(report.output, json!({"other": "other"}));
        assert_eq!(report.state("missing"), Some(NodeStatus::Skipped));
    }

    // -- Loops --------------------------------------------------------------

    fn doubling(max_iterations: Option<u32>) -> Workflow {
        Workflow::new("double")
            .with_node(input("items"))
            .with_node(for_each("loop", max_iterations))
            .with_node(math("double", MathOperation::Multiply, 2))
            .with_edge(Edge::new("items", "loop"))
            .with_edge(Edge::new("loop", "double"))
    }

    #[tokio::test]
    async fn test_for_each_runs_body_per_item() {
        let report = run(&engine(), &doubling(None), json!([1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(report.output, json!({"loop": [2, 4, 6]}));

        let result = report.result("loop").unwrap();
        assert_eq!(result.metadata["iterations"], json!(3));
        assert_eq!(report.result("double").unwrap().output, json!(6));
    }

    #[tokio::test]
    async fn test_for_each_over_empty_array_skips_body() {
        let report = run(&engine(), &doubling(None), json!([])).await.unwrap();
        assert_eq!(report.output, json!({"loop": []}));
        assert_eq!(report.state("double"), Some(NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_for_each_above_ceiling_is_resource_error() {
        let err = run(&engine(), &doubling(Some(2)), json!([1, 2, 3]))
            .await
            .unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "loop");
        assert_eq!(kind, ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_node_ceiling_is_clamped_to_engine_ceiling() {
        let engine = engine_with(|c| c.max_loop_iterations = 2);
        let err = run(&engine, &doubling(Some(10)), json!([1, 2, 3]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        let report = run(&engine, &doubling(Some(10)), json!([1, 2])).await.unwrap();
        assert_eq!(report.result("loop").unwrap().metadata["max_iterations"], json!(2));
    }

    #[tokio::test]
    async fn test_while_loop_exposes_index() {
        let workflow = Workflow::new("w")
            .with_node(Node::new(
                "loop",
                NodeKind::WhileLoop(WhileLoopConfig {
                    condition: "index < 3".into(),
                    max_iterations: None,
                }),
            ))
            .with_node(output("step", "index * 10"))
            .with_edge(Edge::new("loop", "step"));

        let report = run(&engine(), &workflow, Value::Null).await.unwrap();
        let result = report.result("loop").unwrap();
        assert_eq!(result.output, json!([0, 10, 20]));
        assert_eq!(result.metadata["iterations"], json!(3));
        // The body's output node is the only sink; its last value wins.
        assert_eq!(report.output, json!({"step": 20}));
    }

    #[tokio::test]
    async fn test_while_loop_hitting_ceiling_fails() {
        let workflow = Workflow::new("w")
            .with_node(Node::new(
                "loop",
                NodeKind::WhileLoop(WhileLoopConfig {
                    condition: "true".into(),
                    max_iterations: Some(5),
                }),
            ))
            .with_node(constant("step", json!(1)))
            .with_edge(Edge::new("loop", "step"));

        let err = run(&engine(), &workflow, Value::Null).await.unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "loop");
        assert_eq!(kind, ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_while_loop_threads_acc_between_iterations() {
        let workflow = Workflow::new("w")
            .with_node(Node::new(
                "loop",
                NodeKind::WhileLoop(WhileLoopConfig {
                    condition: "index == 0 || acc < 30".into(),
                    max_iterations: None,
                }),
            ))
            .with_node(output("step", "index * 10 + 10"))
            .with_edge(Edge::from_handle("loop", HANDLE_BODY, "step"));

        let report = run(&engine(), &workflow, Value::Null).await.unwrap();
        let result = report.result("loop").unwrap();
        assert_eq!(result.output, json!([10, 20, 30]));
        assert_eq!(result.metadata["iterations"], json!(3));
        assert_eq!(report.state("step"), Some(NodeStatus::Completed));
        assert_eq!(report.output, json!({"step": 30}));
    }

    #[tokio::test]
    async fn test_accumulator_inside_for_each_keeps_running_total() {
        let workflow = Workflow::new("sum")
            .with_node(for_each("loop", None))
            .with_node(Node::new(
                "total",
                NodeKind::Accumulator(AccumulatorConfig {
                    operation: AccumulatorOperation::Sum,
                    initial_value: None,
                }),
            ))
            .with_edge(Edge::new("loop", "total"));

        let report = run(&engine(), &workflow, json!([1, 2, 3])).await.unwrap();
        assert_eq!(report.output, json!({"loop": [1, 3, 6]}));
    }

    // -- Resilience ---------------------------------------------------------

    /// Fails with a transport error until `failures` calls have been made.
    #[derive(Clone)]
    struct Flaky {
        calls: Arc<AtomicU32>,
        failures: u32,
    }

    impl HttpExecutor for Flaky {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(HttpError::Transport("connection reset".into()));
            }
            Ok(HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: json!({"attempt": n}),
            })
        }
    }

    fn fetch_with_retry(max_attempts: u32) -> Workflow {
        Workflow::new("fetch")
            .with_node(Node::new(
                "retry",
                NodeKind::Retry(RetryConfig {
                    max_attempts,
                    backoff_strategy: BackoffStrategy::Constant,
                    initial_delay_ms: 100,
                    ..RetryConfig::default()
                }),
            ))
            .with_node(Node::new(
                "fetch",
                NodeKind::Http(HttpConfig {
                    client: None,
                    method: "GET".into(),
                    url: "https://api.test/items".into(),
                    headers: BTreeMap::new(),
                    body: None,
                    timeout_ms: None,
                    fail_on_status: true,
                }),
            ))
            .with_edge(Edge::from_handle("retry", HANDLE_BODY, "fetch"))
    }

    fn flaky_engine(failures: u32) -> (WorkflowEngine, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let flaky = Flaky {
            calls: Arc::clone(&calls),
            failures,
        };
        let engine = WorkflowEngine::builder(EngineConfig::default())
            .http(HttpClientRegistry::new().with_default(BoxHttpExecutor::new(flaky)))
            .build();
        (engine, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let (engine, calls) = flaky_engine(2);
        let report = run(&engine, &fetch_with_retry(3), Value::Null).await.unwrap();

        let result = report.result("retry").unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output["status"], json!(200));
        assert_eq!(result.output["body"]["attempt"], json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.state("fetch"), Some(NodeStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_reports_failing_body_node() {
        let (engine, calls) = flaky_engine(5);
        let err = run(&engine, &fetch_with_retry(2), Value::Null)
            .await
            .unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "fetch");
        assert_eq!(kind, ErrorKind::Http);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn guarded_division() -> Workflow {
        Workflow::new("guarded")
            .with_node(input("n"))
            .with_node(Node::new("guard", NodeKind::TryCatch(TryCatchConfig::default())))
            .with_node(math("div", MathOperation::Divide, 0))
            .with_node(output("recovered", "input.error"))
            .with_node(output("fine", "input"))
            .with_edge(Edge::new("n", "guard"))
            .with_edge(Edge::from_handle("guard", HANDLE_BODY, "div"))
            .with_edge(Edge::from_handle("guard", "error", "recovered"))
            .with_edge(Edge::from_handle("guard", "success", "fine"))
    }

    #[tokio::test]
    async fn test_try_catch_routes_failure_to_error_handle() {
        let report = run(&engine(), &guarded_division(), json!(10)).await.unwrap();
        assert_eq!(report.output, json!({"recovered": "division by zero"}));
        assert_eq!(report.state("fine"), Some(NodeStatus::Skipped));
        assert_eq!(report.state("div"), Some(NodeStatus::Failed));

        let guard = report.result("guard").unwrap();
        assert_eq!(guard.metadata["caught"], json!(true));
        assert_eq!(guard.output["node"], json!("div"));
        assert_eq!(guard.error.as_ref().unwrap().kind, ErrorKind::Evaluation);
    }

    #[tokio::test]
    async fn test_try_catch_does_not_swallow_resource_errors() {
        let workflow = Workflow::new("w")
            .with_node(input("items"))
            .with_node(Node::new("guard", NodeKind::TryCatch(TryCatchConfig::default())))
            .with_node(for_each("loop", Some(1)))
            .with_node(math("double", MathOperation::Multiply, 2))
            .with_edge(Edge::new("items", "guard"))
            .with_edge(Edge::new("guard", "loop"))
            .with_edge(Edge::new("loop", "double"));

        let err = run(&engine(), &workflow, json!([1, 2])).await.unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "loop");
        assert_eq!(kind, ErrorKind::Resource);
    }

    fn slow_body(action: TimeoutAction) -> Workflow {
        Workflow::new("slow")
            .with_node(Node::new(
                "limit",
                NodeKind::Timeout(TimeoutConfig {
                    timeout_ms: 100,
                    timeout_action: action,
                }),
            ))
            .with_node(constant("first", json!("a")))
            .with_node(delay("wait", 1_000))
            .with_node(constant("after", json!("b")))
            .with_edge(Edge::new("limit", "first"))
            .with_edge(Edge::new("first", "wait"))
            .with_edge(Edge::new("wait", "after"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_continues_with_partial_results() {
        let report = run(&engine(), &slow_body(TimeoutAction::ContinueWithPartial), Value::Null)
            .await
            .unwrap();
        assert_eq!(
            report.output,
            json!({"limit": {"partial": true, "results": {"first": "a"}}})
        );
        assert_eq!(report.state("wait"), Some(NodeStatus::Cancelled));
        assert_eq!(report.state("after"), Some(NodeStatus::Cancelled));
        assert_eq!(report.result("limit").unwrap().metadata["timed_out"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_error_action_fails_run() {
        let err = run(&engine(), &slow_body(TimeoutAction::Error), Value::Null)
            .await
            .unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "limit");
        assert_eq!(kind, ErrorKind::Timeout);
    }

    // -- Joins --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_join_any_takes_first_success_and_cancels_the_rest() {
        let workflow = Workflow::new("race")
            .with_node(input("start"))
            .with_node(math("bad", MathOperation::Divide, 0))
            .with_node(delay("wait_fast", 50))
            .with_node(constant("fast", json!("fast")))
            .with_node(delay("wait_slow", 1_000))
            .with_node(constant("slow", json!("slow")))
            .with_node(Node::new(
                "join",
                NodeKind::Join(JoinConfig {
                    strategy: JoinStrategy::Any,
                    timeout_ms: None,
                }),
            ))
            .with_edge(Edge::new("start", "bad"))
            .with_edge(Edge::new("start", "wait_fast"))
            .with_edge(Edge::new("wait_fast", "fast"))
            .with_edge(Edge::new("start", "wait_slow"))
            .with_edge(Edge::new("wait_slow", "slow"))
            .with_edge(Edge::new("bad", "join"))
            .with_edge(Edge::new("fast", "join"))
            .with_edge(Edge::new("slow", "join"));

        let report = run(&engine(), &workflow, json!(10)).await.unwrap();
        assert_eq!(report.output, json!({"join": "fast"}));
        assert_eq!(report.result("join").unwrap().metadata["winner"], json!("fast"));
        assert_eq!(report.state("bad"), Some(NodeStatus::Failed));
        assert_eq!(report.state("wait_slow"), Some(NodeStatus::Cancelled));
        assert_eq!(report.state("slow"), Some(NodeStatus::Cancelled));
    }

    fn parallel(id: &str, max_concurrency: Option<usize>) -> Node {
        Node::new(id, NodeKind::Parallel(ParallelConfig { max_concurrency }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_max_concurrency_serializes_branches() {
        let workflow = Workflow::new("fan")
            .with_node(parallel("fan", Some(1)))
            .with_node(delay("a", 100))
            .with_node(delay("b", 100))
            .with_node(Node::new("join", NodeKind::Join(JoinConfig::default())))
            .with_edge(Edge::new("fan", "a"))
            .with_edge(Edge::new("fan", "b"))
            .with_edge(Edge::new("a", "join"))
            .with_edge(Edge::new("b", "join"));

        let start = tokio::time::Instant::now();
        let report = run(&engine(), &workflow, Value::Null).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(report.state("join"), Some(NodeStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_without_limit_overlaps_branches() {
        let workflow = Workflow::new("fan")
            .with_node(parallel("fan", None))
            .with_node(delay("a", 100))
            .with_node(delay("b", 100))
            .with_edge(Edge::new("fan", "a"))
            .with_edge(Edge::new("fan", "b"));

        let start = tokio::time::Instant::now();
        run(&engine(), &workflow, Value::Null).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_max_concurrency_covers_retry_bodies() {
        let workflow = Workflow::new("fan")
            .with_node(parallel("fan", Some(1)))
            .with_node(Node::new("r1", NodeKind::Retry(RetryConfig::default())))
            .with_node(Node::new("r2", NodeKind::Retry(RetryConfig::default())))
            .with_node(delay("d1", 100))
            .with_node(delay("d2", 100))
            .with_edge(Edge::new("fan", "r1"))
            .with_edge(Edge::new("fan", "r2"))
            .with_edge(Edge::from_handle("r1", HANDLE_BODY, "d1"))
            .with_edge(Edge::from_handle("r2", HANDLE_BODY, "d2"));

        let start = tokio::time::Instant::now();
        let report = run(&engine(), &workflow, Value::Null).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(report.state("d1"), Some(NodeStatus::Completed));
        assert_eq!(report.state("d2"), Some(NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_join_all_keys_branches_by_source() {
        let workflow = Workflow::new("fan")
            .with_node(input("start"))
            .with_node(math("a", MathOperation::Add, 1))
            .with_node(math("b", MathOperation::Multiply, 3))
            .with_node(Node::new("join", NodeKind::Join(JoinConfig::default())))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("start", "b"))
            .with_edge(Edge::new("a", "join"))
            .with_edge(Edge::new("b", "join"));

        let report = run(&engine(), &workflow, json!(2)).await.unwrap();
        assert_eq!(report.output, json!({"join": {"a": 3, "b": 6}}));
    }

    #[tokio::test]
    async fn test_join_all_fails_when_a_branch_fails() {
        let workflow = Workflow::new("fan")
            .with_node(input("start"))
            .with_node(math("a", MathOperation::Add, 1))
            .with_node(math("b", MathOperation::Divide, 0))
            .with_node(Node::new("join", NodeKind::Join(JoinConfig::default())))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("start", "b"))
            .with_edge(Edge::new("a", "join"))
            .with_edge(Edge::new("b", "join"));

        let err = run(&engine(), &workflow, json!(2)).await.unwrap_err();
        let (node_id, kind, _) = node_failed(err);
        assert_eq!(node_id, "b");
        assert_eq!(kind, ErrorKind::Evaluation);
    }

    // -- Run level ----------------------------------------------------------

    #[tokio::test]
    async fn test_evaluation_error_carries_expression() {
        let workflow = Workflow::new("w").with_node(condition("check", "input.count > 1"));
        let err = run(&engine(), &workflow, json!({"count": "x"}))
            .await
            .unwrap_err();
        let (node_id, kind, expression) = node_failed(err);
        assert_eq!(node_id, "check");
        assert_eq!(kind, ErrorKind::Evaluation);
        assert_eq!(expression.as_deref(), Some("input.count > 1"));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_running() {
        let workflow = Workflow::new("w")
            .with_node(constant("a", json!(1)))
            .with_node(constant("b", json!(2)))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let err = run(&engine(), &workflow, Value::Null).await.unwrap_err();
        assert!(matches!(err, RunError::Validation(ValidationError::CycleDetected(_))));
    }

    fn two_sinks() -> Workflow {
        Workflow::new("sinks")
            .with_node(output("a", "input + 1"))
            .with_node(output("b", "input * 2"))
            .with_edge(Edge::new("a", "b"))
    }

    #[tokio::test]
    async fn test_sink_aggregation_policies() {
        let report = run(&engine(), &two_sinks(), json!(5)).await.unwrap();
        assert_eq!(report.output, json!({"a": 6, "b": 12}));

        let first = engine_with(|c| c.sink_aggregation = SinkAggregation::First);
        let report = run(&first, &two_sinks(), json!(5)).await.unwrap();
        assert_eq!(report.output, json!(6));

        let named = engine_with(|c| c.sink_aggregation = SinkAggregation::Named("b".into()));
        let report = run(&named, &two_sinks(), json!(5)).await.unwrap();
        assert_eq!(report.output, json!(12));
    }

    #[tokio::test]
    async fn test_unknown_named_sink_is_validation_error() {
        let engine = engine_with(|c| c.sink_aggregation = SinkAggregation::Named("zzz".into()));
        let err = run(&engine, &two_sinks(), json!(5)).await.unwrap_err();
        assert_eq!(err, RunError::Validation(ValidationError::UnknownSink("zzz".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_run() {
        let engine = engine();
        let workflow = Workflow::new("w").with_node(delay("wait", 10_000));
        let run_id = Uuid::now_v7();

        let (outcome, cancelled) = tokio::join!(
            engine.run_with_id(run_id, &workflow, Value::Null, Map::new()),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                engine.cancel(run_id)
            }
        );
        assert!(cancelled);
        assert_eq!(outcome.unwrap_err(), RunError::Cancelled);
        assert!(engine.active_runs().is_empty());
        assert!(!engine.cancel(run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let engine = engine_with(|c| c.run_timeout_ms = Some(50));
        let workflow = Workflow::new("w").with_node(delay("wait", 10_000));
        let err = run(&engine, &workflow, Value::Null).await.unwrap_err();
        assert_eq!(err, RunError::Timeout(50));
    }
}
