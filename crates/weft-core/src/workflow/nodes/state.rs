//! State primitives: variable, counter, accumulator, cache.
//!
//! `workflow`/`local` variables, run counters and accumulators live in the
//! run's [`ExecutionContext`](crate::workflow::context::ExecutionContext).
//! `global` variables, global counters and the cache go through the injected
//! stores, which serialize writes per key.

use std::time::Duration;

use serde_json::Value;
use weft_types::error::NodeError;
use weft_types::node::{
    AccumulatorConfig, AccumulatorOperation, CacheConfig, CacheOperation, CounterConfig,
    CounterOperation, CounterScope, VariableConfig, VariableOperation, VariableScope,
};

use crate::expression::kind_name;
use crate::storage::CachePolicy;

use super::{NodeCall, Outcome, invalid};

// ---------------------------------------------------------------------------
// Variable
// ---------------------------------------------------------------------------

pub async fn variable(call: &NodeCall<'_>, cfg: &VariableConfig) -> Result<Outcome, NodeError> {
    let name = cfg.name.as_str();
    let scope = match cfg.scope {
        VariableScope::Global => "global",
        VariableScope::Workflow => "workflow",
        VariableScope::Local => "local",
    };

    match cfg.operation {
        VariableOperation::Get => {
            let found = match cfg.scope {
                VariableScope::Global => call.ctx.services.globals.get(name).await?,
                VariableScope::Workflow => call.ctx.variable(name),
                VariableScope::Local => call.ctx.local(call.idx, name),
            };
            let hit = found.is_some();
            let value = found.or_else(|| cfg.default.clone()).unwrap_or(Value::Null);
            Ok(Outcome::value(value)
                .meta("name", name)
                .meta("scope", scope)
                .meta("found", hit))
        }
        VariableOperation::Set => {
            let value = match (&cfg.value, cfg.expression.as_deref()) {
                (Some(literal), _) => literal.clone(),
                (None, Some(expr)) => call.eval(expr)?,
                (None, None) => call.input.clone(),
            };
            match cfg.scope {
                VariableScope::Global => {
                    call.ctx.services.globals.set(name, value.clone()).await?
                }
                VariableScope::Workflow => call.ctx.set_variable(name, value.clone()),
                VariableScope::Local => call.ctx.set_local(call.idx, name, value.clone()),
            }
            tracing::debug!(node_id = %call.node.id, name, scope, "variable set");
            Ok(Outcome::value(value).meta("name", name).meta("scope", scope))
        }
    }
}

// ---------------------------------------------------------------------------
// Counter
// ---------------------------------------------------------------------------

fn step_counter(cfg: &CounterConfig, current: Option<i64>) -> i64 {
    let current = current.unwrap_or(cfg.initial_value);
    match cfg.operation {
        CounterOperation::Increment => current.saturating_add(cfg.delta),
        CounterOperation::Decrement => current.saturating_sub(cfg.delta),
        CounterOperation::Reset => cfg.initial_value,
        CounterOperation::Get => current,
    }
}

pub async fn counter(call: &NodeCall<'_>, cfg: &CounterConfig) -> Result<Outcome, NodeError> {
    let name = cfg.name.clone().unwrap_or_else(|| call.node.id.clone());
    let value = match cfg.scope {
        CounterScope::Run => call.ctx.update_counter(&name, |cur| step_counter(cfg, cur)),
        CounterScope::Global => {
            let step = cfg.clone();
            let next = call
                .ctx
                .services
                .globals
                .update(
                    &name,
                    Box::new(move |cur| {
                        Value::from(step_counter(&step, cur.and_then(|v| v.as_i64())))
                    }),
                )
                .await?;
            next.as_i64().unwrap_or(cfg.initial_value)
        }
    };
    Ok(Outcome::value(Value::from(value))
        .meta("name", name)
        .meta("operation", format!("{:?}", cfg.operation).to_lowercase()))
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

fn identity(op: AccumulatorOperation) -> Value {
    match op {
        AccumulatorOperation::Sum | AccumulatorOperation::Count => Value::from(0),
        AccumulatorOperation::Product => Value::from(1),
        AccumulatorOperation::Concat => Value::from(""),
        AccumulatorOperation::Array => Value::Array(Vec::new()),
    }
}

fn arithmetic(op: AccumulatorOperation, acc: &Value, x: &Value) -> Result<Value, NodeError> {
    let (Value::Number(a), Value::Number(b)) = (acc, x) else {
        return Err(invalid(format!(
            "cannot {} {} into {}",
            format!("{op:?}").to_lowercase(),
            kind_name(x),
            kind_name(acc)
        )));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            AccumulatorOperation::Product => a.checked_mul(b),
            _ => a.checked_add(b),
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let v = match op {
        AccumulatorOperation::Product => a * b,
        _ => a + b,
    };
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| invalid(format!("accumulator produced a non-finite result ({v})")))
}

/// Fold one value. Array inputs are folded element by element.
fn fold(op: AccumulatorOperation, acc: Value, input: &Value) -> Result<Value, NodeError> {
    if let Value::Array(items) = input {
        return items.iter().try_fold(acc, |acc, item| fold_one(op, acc, item));
    }
    fold_one(op, acc, input)
}

fn fold_one(op: AccumulatorOperation, acc: Value, x: &Value) -> Result<Value, NodeError> {
    match op {
        AccumulatorOperation::Sum | AccumulatorOperation::Product => arithmetic(op, &acc, x),
        AccumulatorOperation::Count => arithmetic(op, &acc, &Value::from(1)),
        AccumulatorOperation::Concat => {
            let Value::String(mut s) = acc else {
                return Err(invalid(format!(
                    "concat accumulator holds {}, expected a string",
                    kind_name(&acc)
                )));
            };
            match x {
                Value::String(piece) => s.push_str(piece),
                Value::Null => {}
                other => s.push_str(&other.to_string()),
            }
            Ok(Value::String(s))
        }
        AccumulatorOperation::Array => match acc {
            Value::Array(mut items) => {
                items.push(x.clone());
                Ok(Value::Array(items))
            }
            other => Err(invalid(format!(
                "array accumulator holds {}, expected an array",
                kind_name(&other)
            ))),
        },
    }
}

/// Combine the input into this node's per-run state.
pub fn accumulator(call: &NodeCall<'_>, cfg: &AccumulatorConfig) -> Result<Outcome, NodeError> {
    let op = cfg.operation;
    let value = call.ctx.accumulate(call.idx, |prev| {
        let seed = match prev {
            Some(v) => v.clone(),
            None => cfg.initial_value.clone().unwrap_or_else(|| identity(op)),
        };
        fold(op, seed, &call.input)
    })?;
    Ok(Outcome::value(value).meta("operation", format!("{op:?}").to_lowercase()))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub async fn cache(call: &NodeCall<'_>, cfg: &CacheConfig) -> Result<Outcome, NodeError> {
    let key = match call.eval(&cfg.key)? {
        Value::String(s) => s,
        Value::Null => return Err(invalid(format!("cache key '{}' evaluated to null", cfg.key))),
        other => other.to_string(),
    };
    let store = &call.ctx.services.cache;

    match cfg.operation {
        CacheOperation::Get => {
            let found = store.get(&key).await?;
            let hit = found.is_some();
            tracing::debug!(node_id = %call.node.id, key = key.as_str(), hit, "cache lookup");
            Ok(Outcome::value(found.unwrap_or(Value::Null))
                .meta("key", key)
                .meta("hit", hit))
        }
        CacheOperation::Set => {
            let value = match cfg.value.as_deref() {
                Some(expr) => call.eval(expr)?,
                None => call.input.clone(),
            };
            let policy = CachePolicy {
                ttl: cfg.ttl_ms.map(Duration::from_millis),
                max_size: cfg.max_size,
                eviction: cfg.eviction,
            };
            store.set(&key, value.clone(), policy).await?;
            Ok(Outcome::value(value).meta("key", key))
        }
        CacheOperation::Delete => {
            let deleted = store.delete(&key).await?;
            Ok(Outcome::value(call.input.clone())
                .meta("key", key)
                .meta("deleted", deleted))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::nodes::testing::{call, context};
    use crate::workflow::nodes::invoke;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use weft_types::node::{EvictionPolicy, NodeKind};
    use weft_types::workflow::Node;

    fn accumulator_node(operation: AccumulatorOperation) -> Node {
        Node::new(
            "acc",
            NodeKind::Accumulator(AccumulatorConfig {
                operation,
                initial_value: None,
            }),
        )
    }

    async fn feed(operation: AccumulatorOperation, inputs: &[Value]) -> Value {
        let ctx = context(accumulator_node(operation));
        let token = CancellationToken::new();
        let mut last = Value::Null;
        for input in inputs {
            last = invoke(&call(&ctx, input.clone(), &token)).await.unwrap().output;
        }
        last
    }

    #[tokio::test]
    async fn test_accumulator_array_and_sum_over_successive_inputs() {
        let inputs = [json!(1), json!(2), json!(3)];
        assert_eq!(feed(AccumulatorOperation::Array, &inputs).await, json!([1, 2, 3]));
        assert_eq!(feed(AccumulatorOperation::Sum, &inputs).await, json!(6));
        assert_eq!(feed(AccumulatorOperation::Product, &inputs).await, json!(6));
        assert_eq!(feed(AccumulatorOperation::Count, &inputs).await, json!(3));
    }

    #[tokio::test]
    async fn test_accumulator_folds_array_input() {
        let input = [json!([1, 2, 3])];
        assert_eq!(feed(AccumulatorOperation::Array, &input).await, json!([1, 2, 3]));
        assert_eq!(feed(AccumulatorOperation::Sum, &input).await, json!(6));
        assert_eq!(
            feed(AccumulatorOperation::Concat, &[json!("a"), json!(["b", 1])]).await,
            json!("ab1")
        );
    }

    #[tokio::test]
    async fn test_sum_rejects_strings() {
        let ctx = context(accumulator_node(AccumulatorOperation::Sum));
        let token = CancellationToken::new();
        let err = invoke(&call(&ctx, json!("x"), &token)).await.unwrap_err();
        assert!(err.message.contains("string"));
    }

    fn counter_node(operation: CounterOperation, scope: CounterScope) -> Node {
        Node::new(
            "hits",
            NodeKind::Counter(CounterConfig {
                operation,
                delta: 2,
                initial_value: 10,
                scope,
                name: Some("hits".into()),
            }),
        )
    }

    #[tokio::test]
    async fn test_run_counter_increments_from_initial_value() {
        let ctx = context(counter_node(CounterOperation::Increment, CounterScope::Run));
        let token = CancellationToken::new();
        let first = invoke(&call(&ctx, Value::Null, &token)).await.unwrap();
        let second = invoke(&call(&ctx, Value::Null, &token)).await.unwrap();
        assert_eq!(first.output, json!(12));
        assert_eq!(second.output, json!(14));
        assert_eq!(ctx.counter("hits"), Some(14));
    }

    #[tokio::test]
    async fn test_global_counter_goes_through_store() {
        let ctx = context(counter_node(CounterOperation::Decrement, CounterScope::Global));
        let token = CancellationToken::new();
        let out = invoke(&call(&ctx, Value::Null, &token)).await.unwrap();
        assert_eq!(out.output, json!(8));
        assert_eq!(
            ctx.services.globals.get("hits").await.unwrap(),
            Some(json!(8))
        );
    }

    #[tokio::test]
    async fn test_variable_scopes() {
        let set = Node::new(
            "set",
            NodeKind::Variable(VariableConfig {
                operation: VariableOperation::Set,
                name: "greeting".into(),
                scope: VariableScope::Workflow,
                value: None,
                expression: Some("'hi ' + input".into()),
                default: None,
            }),
        );
        let ctx = context(set);
        let token = CancellationToken::new();
        let out = invoke(&call(&ctx, json!("bob"), &token)).await.unwrap();
        assert_eq!(out.output, json!("hi bob"));
        assert_eq!(ctx.variable("greeting"), Some(json!("hi bob")));
        assert_eq!(ctx.variables_view(0)["greeting"], json!("hi bob"));
    }

    #[tokio::test]
    async fn test_variable_get_falls_back_to_default() {
        let get = Node::new(
            "get",
            NodeKind::Variable(VariableConfig {
                operation: VariableOperation::Get,
                name: "missing".into(),
                scope: VariableScope::Local,
                value: None,
                expression: None,
                default: Some(json!(0)),
            }),
        );
        let ctx = context(get);
        let token = CancellationToken::new();
        let out = invoke(&call(&ctx, Value::Null, &token)).await.unwrap();
        assert_eq!(out.output, json!(0));
        assert_eq!(out.metadata["found"], json!(false));
    }

    #[tokio::test]
    async fn test_cache_set_then_get() {
        let set = CacheConfig {
            operation: CacheOperation::Set,
            key: "'user:' + input.id".into(),
            value: Some("input.name".into()),
            ttl_ms: Some(60_000),
            max_size: Some(10),
            eviction: EvictionPolicy::Lru,
        };
        let ctx = context(Node::new("c", NodeKind::Cache(set.clone())));
        let token = CancellationToken::new();
        let input = json!({"id": "7", "name": "Ada"});
        cache(&call(&ctx, input.clone(), &token), &set).await.unwrap();

        let get = CacheConfig {
            operation: CacheOperation::Get,
            value: None,
            ..set
        };
        let out = cache(&call(&ctx, input, &token), &get).await.unwrap();
        assert_eq!(out.output, json!("Ada"));
        assert_eq!(out.metadata["hit"], json!(true));
        assert_eq!(out.metadata["key"], json!("user:7"));
    }
}
