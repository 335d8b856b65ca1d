//! Branch selection and fan-out: condition, switch, split, partition, join.

use serde_json::{Map, Value, json};
use weft_types::error::NodeError;
use weft_types::node::{ArrayExprConfig, ConditionConfig, SplitConfig, SwitchConfig};
use weft_types::workflow::{HANDLE_FALSE, HANDLE_MATCHING, HANDLE_NON_MATCHING, HANDLE_TRUE};

use crate::expression::{Scoped, loose_eq};

use super::array::{for_each_item, source_array};
use super::{NodeCall, Outcome};

/// Evaluate a boolean expression and select `true` or `false`.
pub fn condition(call: &NodeCall<'_>, cfg: &ConditionConfig) -> Result<Outcome, NodeError> {
    let met = call.eval_bool(&cfg.expression)?;
    let path = if met { HANDLE_TRUE } else { HANDLE_FALSE };
    tracing::debug!(node_id = %call.node.id, path, "condition evaluated");

    Ok(Outcome::value(json!({
        "condition_met": met,
        "expression": cfg.expression,
        "path": path,
        "value": call.input,
    }))
    .with_handle(path, call.input.clone())
    .select(vec![path.to_string()])
    .meta("path", path))
}

/// First matching case wins. `value` cases use typed equality, so a value of
/// a different kind simply does not match.
pub fn switch(call: &NodeCall<'_>, cfg: &SwitchConfig) -> Result<Outcome, NodeError> {
    let subject = match cfg.field.as_deref() {
        Some(expr) => call.eval(expr)?,
        None => call.input.clone(),
    };

    let bindings = call.bindings();
    let mut matched = None;
    for (i, case) in cfg.cases.iter().enumerate() {
        let hit = if case.is_default {
            true
        } else if let Some(expected) = &case.value {
            loose_eq(&subject, expected)
        } else if let Some(when) = &case.when {
            let scoped = Scoped::new(&bindings).with("value", subject.clone());
            call.ctx
                .evaluator()
                .evaluate_bool_for_node(when, &scoped)?
        } else {
            false
        };
        if hit {
            matched = Some((i, case.path()));
            break;
        }
    }

    // Validation guarantees a trailing default, so this only fires for
    // hand-built workflows that skipped it.
    let Some((index, path)) = matched else {
        return Err(NodeError::invocation(format!(
            "switch '{}' has no matching case and no default",
            call.node.id
        )));
    };
    tracing::debug!(node_id = %call.node.id, path, "switch case selected");

    Ok(Outcome::value(json!({
        "matched_case": index,
        "path": path,
        "value": subject,
    }))
    .with_handle(path, call.input.clone())
    .select(vec![path.to_string()])
    .meta("path", path))
}

/// Same input on every named path; nothing is pruned.
pub fn split(call: &NodeCall<'_>, cfg: &SplitConfig) -> Outcome {
    cfg.paths
        .iter()
        .fold(Outcome::value(call.input.clone()), |outcome, path| {
            outcome.with_handle(path, call.input.clone())
        })
        .meta("paths", cfg.paths.clone())
}

/// Split an array by predicate into `matching` and `non_matching`.
pub fn partition(call: &NodeCall<'_>, cfg: &ArrayExprConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut matching = Vec::new();
    let mut rest = Vec::new();
    for_each_item(call, &items, |item, scoped| {
        let keep = call
            .ctx
            .evaluator()
            .evaluate_bool_for_node(&cfg.expression, scoped)?;
        if keep {
            matching.push(item.clone());
        } else {
            rest.push(item.clone());
        }
        Ok(())
    })?;

    let (matching, rest) = (Value::Array(matching), Value::Array(rest));
    let mut output = Map::new();
    output.insert(HANDLE_MATCHING.to_string(), matching.clone());
    output.insert(HANDLE_NON_MATCHING.to_string(), rest.clone());
    Ok(Outcome::value(Value::Object(output))
        .with_handle(HANDLE_MATCHING, matching)
        .with_handle(HANDLE_NON_MATCHING, rest))
}

/// `all` join output: one entry per live inbound edge.
pub fn join_all(call: &NodeCall<'_>) -> Value {
    let map: Map<String, Value> = call
        .inbound
        .iter()
        .map(|i| (i.key.clone(), i.value.clone()))
        .collect();
    Value::Object(map)
}
