//! Array transforms: array in, array or value out, no branching.
//!
//! Every transform reads its array from the optional `source` expression or,
//! without one, from the node input. Per-element expressions see `item` and
//! `index`; `reduce` also sees `acc`.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use weft_types::error::NodeError;
use weft_types::node::{
    ArrayExprConfig, ArraySourceConfig, ChunkConfig, GroupByConfig, RangeConfig, ReduceConfig,
    SampleConfig, SliceConfig, SortConfig, UniqueConfig,
};
use weft_types::workflow::{HANDLE_LEFT, HANDLE_RIGHT};

use crate::expression::{Bindings, Scoped, compare_values, kind_name};

use super::{NodeCall, Outcome, invalid};

/// Largest array `range` will materialize.
const MAX_RANGE_LEN: usize = 1_000_000;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn source_array(call: &NodeCall<'_>, source: Option<&str>) -> Result<Vec<Value>, NodeError> {
    let value = match source {
        Some(expr) => call.eval(expr)?,
        None => call.input.clone(),
    };
    expect_array(value)
}

fn expect_array(value: Value) -> Result<Vec<Value>, NodeError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(invalid(format!(
            "expected an array, got {}",
            kind_name(&other)
        ))),
    }
}

/// Run `f` once per element with `item` and `index` bound.
pub(crate) fn for_each_item<F>(call: &NodeCall<'_>, items: &[Value], mut f: F) -> Result<(), NodeError>
where
    F: FnMut(&Value, &dyn Bindings) -> Result<(), NodeError>,
{
    let bindings = call.bindings();
    for (i, item) in items.iter().enumerate() {
        let scoped = Scoped::new(&bindings)
            .with("item", item.clone())
            .with("index", Value::from(i));
        f(item, &scoped)?;
    }
    Ok(())
}

fn eval_in(call: &NodeCall<'_>, expression: &str, scope: &dyn Bindings) -> Result<Value, NodeError> {
    call.ctx.evaluator().evaluate_for_node(expression, scope)
}

fn array_outcome(items: Vec<Value>) -> Outcome {
    let len = items.len();
    Outcome::value(Value::Array(items)).meta("length", len)
}

/// Group and uniqueness key for a value.
fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Predicate and projection transforms
// ---------------------------------------------------------------------------

pub fn filter(call: &NodeCall<'_>, cfg: &ArrayExprConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut kept = Vec::new();
    for_each_item(call, &items, |item, scope| {
        if call
            .ctx
            .evaluator()
            .evaluate_bool_for_node(&cfg.expression, scope)?
        {
            kept.push(item.clone());
        }
        Ok(())
    })?;
    Ok(array_outcome(kept))
}

pub fn map(call: &NodeCall<'_>, cfg: &ArrayExprConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut mapped = Vec::with_capacity(items.len());
    for_each_item(call, &items, |_, scope| {
        mapped.push(eval_in(call, &cfg.expression, scope)?);
        Ok(())
    })?;
    Ok(array_outcome(mapped))
}

pub fn flat_map(call: &NodeCall<'_>, cfg: &ArrayExprConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut flat = Vec::new();
    for_each_item(call, &items, |_, scope| {
        match eval_in(call, &cfg.expression, scope)? {
            Value::Array(inner) => flat.extend(inner),
            other => flat.push(other),
        }
        Ok(())
    })?;
    Ok(array_outcome(flat))
}

pub fn find(call: &NodeCall<'_>, cfg: &ArrayExprConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let bindings = call.bindings();
    for (i, item) in items.iter().enumerate() {
        let scope = Scoped::new(&bindings)
            .with("item", item.clone())
            .with("index", Value::from(i));
        if call
            .ctx
            .evaluator()
            .evaluate_bool_for_node(&cfg.expression, &scope)?
        {
            return Ok(Outcome::value(item.clone())
                .meta("found", true)
                .meta("index", i));
        }
    }
    Ok(Outcome::value(Value::Null).meta("found", false))
}

pub fn reduce(call: &NodeCall<'_>, cfg: &ReduceConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let bindings = call.bindings();
    let mut acc = cfg.initial_value.clone();
    for (i, item) in items.iter().enumerate() {
        let scope = Scoped::new(&bindings)
            .with("item", item.clone())
            .with("index", Value::from(i))
            .with("acc", acc);
        acc = eval_in(call, &cfg.expression, &scope)?;
    }
    Ok(Outcome::value(acc))
}

// ---------------------------------------------------------------------------
// Ordering and selection
// ---------------------------------------------------------------------------

pub fn sort(call: &NodeCall<'_>, cfg: &SortConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
    match cfg.key.as_deref() {
        Some(expr) => for_each_item(call, &items, |item, scope| {
            keyed.push((eval_in(call, expr, scope)?, item.clone()));
            Ok(())
        })?,
        None => keyed.extend(items.into_iter().map(|v| (v.clone(), v))),
    }

    let mut mismatch = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let ord = compare_values(a, b).unwrap_or_else(|| {
            mismatch.get_or_insert_with(|| {
                format!("cannot sort {} against {}", kind_name(a), kind_name(b))
            });
            Ordering::Equal
        });
        if cfg.descending { ord.reverse() } else { ord }
    });
    if let Some(message) = mismatch {
        return Err(invalid(message));
    }
    Ok(array_outcome(keyed.into_iter().map(|(_, v)| v).collect()))
}

/// Negative bounds count from the end; out-of-range bounds clamp.
pub fn slice(call: &NodeCall<'_>, cfg: &SliceConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let len = items.len() as i64;
    let resolve = |i: i64| (if i < 0 { (len + i).max(0) } else { i.min(len) }) as usize;
    let start = resolve(cfg.start);
    let end = cfg.end.map_or(items.len(), resolve);
    let out = if start < end {
        items[start..end].to_vec()
    } else {
        Vec::new()
    };
    Ok(array_outcome(out))
}

pub fn chunk(call: &NodeCall<'_>, cfg: &ChunkConfig) -> Result<Outcome, NodeError> {
    if cfg.size == 0 {
        return Err(invalid("chunk size must be at least 1"));
    }
    let items = source_array(call, cfg.source.as_deref())?;
    let chunks = items
        .chunks(cfg.size)
        .map(|c| Value::Array(c.to_vec()))
        .collect();
    Ok(array_outcome(chunks))
}

/// Random subset; a `seed` makes the choice reproducible.
pub fn sample(call: &NodeCall<'_>, cfg: &SampleConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let picked = items
        .choose_multiple(&mut rng, cfg.count.min(items.len()))
        .cloned()
        .collect();
    Ok(array_outcome(picked))
}

/// `start..end` by `step`; end is exclusive.
pub fn range(cfg: &RangeConfig) -> Result<Outcome, NodeError> {
    if cfg.step == 0 {
        return Err(invalid("range step must not be 0"));
    }
    let span = if cfg.step > 0 {
        cfg.end.saturating_sub(cfg.start)
    } else {
        cfg.start.saturating_sub(cfg.end)
    };
    let len = if span <= 0 {
        0
    } else {
        (span as u64).div_ceil(cfg.step.unsigned_abs())
    };
    if len > MAX_RANGE_LEN as u64 {
        return Err(NodeError::resource(format!(
            "range of {len} elements exceeds the limit of {MAX_RANGE_LEN}"
        )));
    }
    let values = (0..len as i64)
        .map(|i| Value::from(cfg.start + i * cfg.step))
        .collect();
    Ok(array_outcome(values))
}

// ---------------------------------------------------------------------------
// Structural transforms
// ---------------------------------------------------------------------------

/// Pairs elements of the `left` and `right` ports, or of each inner array of
/// an array-of-arrays input. Stops at the shortest.
pub fn zip(call: &NodeCall<'_>, cfg: &ArraySourceConfig) -> Result<Outcome, NodeError> {
    let columns: Vec<Vec<Value>> = match (call.port(HANDLE_LEFT), call.port(HANDLE_RIGHT)) {
        (Some(left), Some(right)) if cfg.source.is_none() => {
            vec![expect_array(left.clone())?, expect_array(right.clone())?]
        }
        _ => source_array(call, cfg.source.as_deref())?
            .into_iter()
            .map(expect_array)
            .collect::<Result<_, _>>()?,
    };
    let len = columns.iter().map(Vec::len).min().unwrap_or(0);
    let rows = (0..len)
        .map(|i| Value::Array(columns.iter().map(|c| c[i].clone()).collect()))
        .collect();
    Ok(array_outcome(rows))
}

pub fn unique(call: &NodeCall<'_>, cfg: &UniqueConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for_each_item(call, &items, |item, scope| {
        let key = match cfg.key.as_deref() {
            Some(expr) => eval_in(call, expr, scope)?,
            None => item.clone(),
        };
        if seen.insert(key.to_string()) {
            out.push(item.clone());
        }
        Ok(())
    })?;
    Ok(array_outcome(out))
}

/// Object of key → elements. Non-string keys are rendered as JSON.
pub fn group_by(call: &NodeCall<'_>, cfg: &GroupByConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    let mut groups: Map<String, Value> = Map::new();
    for_each_item(call, &items, |item, scope| {
        let key = key_string(&eval_in(call, &cfg.key, scope)?);
        if let Value::Array(group) = groups.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
            group.push(item.clone());
        }
        Ok(())
    })?;
    let count = groups.len();
    Ok(Outcome::value(Value::Object(groups)).meta("groups", count))
}

pub fn compact(call: &NodeCall<'_>, cfg: &ArraySourceConfig) -> Result<Outcome, NodeError> {
    let items = source_array(call, cfg.source.as_deref())?;
    Ok(array_outcome(
        items.into_iter().filter(|v| !v.is_null()).collect(),
    ))
}

pub fn reverse(call: &NodeCall<'_>, cfg: &ArraySourceConfig) -> Result<Outcome, NodeError> {
    let mut items = source_array(call, cfg.source.as_deref())?;
    items.reverse();
    Ok(array_outcome(items))
}

/// Rows become columns; ragged rows are padded with `null`.
pub fn transpose(call: &NodeCall<'_>, cfg: &ArraySourceConfig) -> Result<Outcome, NodeError> {
    let rows = source_array(call, cfg.source.as_deref())?
        .into_iter()
        .map(expect_array)
        .collect::<Result<Vec<_>, _>>()?;
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let columns = (0..width)
        .map(|c| {
            Value::Array(
                rows.iter()
                    .map(|r| r.get(c).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect();
    Ok(array_outcome(columns))
}
