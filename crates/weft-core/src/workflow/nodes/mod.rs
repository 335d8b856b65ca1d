//! Leaf node behaviors.
//!
//! Every non-scoped [`NodeKind`] maps to one behavior function through the
//! dispatch table in [`invoke`]. Behaviors are independent of the scheduler:
//! they receive a [`NodeCall`] (input, bindings, cancellation) and return an
//! [`Outcome`] describing the output and which handles are live.

pub mod array;
pub mod basic;
pub mod control;
pub mod http;
pub mod state;

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use weft_types::error::{ErrorKind, NodeError};
use weft_types::node::NodeKind;
use weft_types::workflow::Node;

use super::context::{ExecutionContext, Frame, NodeBindings};

/// One value arriving on a live inbound edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// The edge's target handle, or the source node id when it has none.
    pub key: String,
    pub value: Value,
}

/// Everything a behavior may read.
pub struct NodeCall<'a> {
    pub ctx: &'a ExecutionContext,
    pub frame: &'a Frame,
    pub idx: usize,
    pub node: &'a Node,
    pub input: Value,
    pub inbound: Vec<Inbound>,
    pub cancel: &'a CancellationToken,
}

impl NodeCall<'_> {
    pub fn bindings(&self) -> NodeBindings<'_> {
        NodeBindings {
            ctx: self.ctx,
            frame: self.frame,
            node: self.idx,
            input: &self.input,
        }
    }

    pub fn eval(&self, expression: &str) -> Result<Value, NodeError> {
        self.ctx
            .evaluator()
            .evaluate_for_node(expression, &self.bindings())
    }

    pub fn eval_bool(&self, expression: &str) -> Result<bool, NodeError> {
        self.ctx
            .evaluator()
            .evaluate_bool_for_node(expression, &self.bindings())
    }

    /// Value arriving on the inbound edge keyed `key`.
    pub fn port(&self, key: &str) -> Option<&Value> {
        self.inbound.iter().find(|i| i.key == key).map(|i| &i.value)
    }
}

/// What a behavior produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub output: Value,
    pub handle_outputs: BTreeMap<String, Value>,
    /// `None` leaves every outgoing edge live.
    pub selected_handles: Option<Vec<String>>,
    pub metadata: Map<String, Value>,
}

impl Outcome {
    pub fn value(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>, value: Value) -> Self {
        self.handle_outputs.insert(handle.into(), value);
        self
    }

    pub fn select(mut self, handles: Vec<String>) -> Self {
        self.selected_handles = Some(handles);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Evaluation error without expression text (bad input shape, bad operand).
pub(crate) fn invalid(message: impl Into<String>) -> NodeError {
    NodeError::new(ErrorKind::Evaluation, message)
}

/// Dispatch to the behavior for `call.node`'s kind.
pub async fn invoke(call: &NodeCall<'_>) -> Result<Outcome, NodeError> {
    match &call.node.kind {
        NodeKind::Input(cfg) => basic::input(call, cfg),
        NodeKind::Constant(cfg) => Ok(Outcome::value(cfg.value.clone())),
        NodeKind::Output(cfg) => basic::output(call, cfg),
        NodeKind::Math(cfg) => basic::math(call, cfg),
        NodeKind::Text(cfg) => basic::text(call, cfg),
        NodeKind::Delay(cfg) => basic::delay(call, cfg).await,

        NodeKind::Condition(cfg) => control::condition(call, cfg),
        NodeKind::Switch(cfg) => control::switch(call, cfg),
        NodeKind::Parallel(_) => Ok(Outcome::value(call.input.clone())),
        NodeKind::Split(cfg) => Ok(control::split(call, cfg)),
        NodeKind::Partition(cfg) => control::partition(call, cfg),
        NodeKind::Join(_) => Ok(Outcome::value(control::join_all(call))),

        NodeKind::Filter(cfg) => array::filter(call, cfg),
        NodeKind::Map(cfg) => array::map(call, cfg),
        NodeKind::Reduce(cfg) => array::reduce(call, cfg),
        NodeKind::FlatMap(cfg) => array::flat_map(call, cfg),
        NodeKind::Find(cfg) => array::find(call, cfg),
        NodeKind::Sort(cfg) => array::sort(call, cfg),
        NodeKind::Slice(cfg) => array::slice(call, cfg),
        NodeKind::Chunk(cfg) => array::chunk(call, cfg),
        NodeKind::Sample(cfg) => array::sample(call, cfg),
        NodeKind::Range(cfg) => array::range(cfg),
        NodeKind::Zip(cfg) => array::zip(call, cfg),
        NodeKind::Unique(cfg) => array::unique(call, cfg),
        NodeKind::GroupBy(cfg) => array::group_by(call, cfg),
        NodeKind::Compact(cfg) => array::compact(call, cfg),
        NodeKind::Reverse(cfg) => array::reverse(call, cfg),
        NodeKind::Transpose(cfg) => array::transpose(call, cfg),

        NodeKind::Variable(cfg) => state::variable(call, cfg).await,
        NodeKind::Counter(cfg) => state::counter(call, cfg).await,
        NodeKind::Accumulator(cfg) => state::accumulator(call, cfg),
        NodeKind::Cache(cfg) => state::cache(call, cfg).await,

        NodeKind::Http(cfg) => http::request(call, cfg).await,

        NodeKind::ForEach(_)
        | NodeKind::WhileLoop(_)
        | NodeKind::Retry(_)
        | NodeKind::TryCatch(_)
        | NodeKind::Timeout(_) => Err(NodeError::invocation(format!(
            "'{}' runs a body and has no leaf behavior",
            call.node.type_name()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for calling behaviors without a scheduler.

    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use weft_types::config::EngineConfig;
    use weft_types::workflow::{Node, Workflow};

    use crate::expression::ExpressionEvaluator;
    use crate::http::HttpClientRegistry;
    use crate::storage::{BoxCacheStore, BoxVariableStore, MemoryCacheStore, MemoryVariableStore};
    use crate::workflow::context::{ExecutionContext, Services};
    use crate::workflow::graph::ExecutionPlan;

    use super::NodeCall;

    pub fn services_with(http: HttpClientRegistry) -> Arc<Services> {
        Arc::new(Services {
            config: EngineConfig::default(),
            evaluator: ExpressionEvaluator::new(),
            cache: BoxCacheStore::new(MemoryCacheStore::new()),
            globals: BoxVariableStore::new(MemoryVariableStore::new()),
            http,
            workers: Arc::new(Semaphore::new(4)),
        })
    }

    /// A context whose workflow holds just `node`.
    pub fn context_for(node: Node, services: Arc<Services>) -> ExecutionContext {
        let workflow = Workflow::new("test").with_node(node);
        let plan = ExecutionPlan::build(&workflow).expect("valid test workflow");
        ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(plan),
            services,
            Value::Null,
            Default::default(),
        )
    }

    pub fn context(node: Node) -> ExecutionContext {
        context_for(node, services_with(HttpClientRegistry::new()))
    }

    /// A call to the context's single node.
    pub fn call<'a>(
        ctx: &'a ExecutionContext,
        input: Value,
        cancel: &'a CancellationToken,
    ) -> NodeCall<'a> {
        NodeCall {
            ctx,
            frame: &ctx.root,
            idx: 0,
            node: ctx.plan.node(0),
            input,
            inbound: Vec::new(),
            cancel,
        }
    }
}
