//! Leaves, arithmetic, text and delay.

use std::time::Duration;

use serde_json::{Number, Value};
use weft_types::error::NodeError;
use weft_types::node::{
    DelayConfig, InputConfig, MathConfig, MathOperation, OutputConfig, TextConfig, TextOperation,
};

use crate::expression::{kind_name, render_template};

use super::{NodeCall, Outcome, invalid};

// ---------------------------------------------------------------------------
// Leaves
// ---------------------------------------------------------------------------

/// Read the run input, or one dotted field of it. A missing field yields the
/// configured default, or `null`.
pub fn input(call: &NodeCall<'_>, cfg: &InputConfig) -> Result<Outcome, NodeError> {
    let value = match cfg.field.as_deref() {
        None => Some(call.ctx.input.clone()),
        Some(path) => lookup(&call.ctx.input, path).cloned(),
    };
    Ok(Outcome::value(
        value
            .filter(|v| !v.is_null())
            .or_else(|| cfg.default.clone())
            .unwrap_or(Value::Null),
    ))
}

/// `a.b.0.c` style lookup; numeric segments index arrays.
pub(crate) fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |v, segment| match v {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

pub fn output(call: &NodeCall<'_>, cfg: &OutputConfig) -> Result<Outcome, NodeError> {
    let value = match cfg.expression.as_deref() {
        Some(expr) => call.eval(expr)?,
        None => call.input.clone(),
    };
    Ok(Outcome::value(value))
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

pub fn math(call: &NodeCall<'_>, cfg: &MathConfig) -> Result<Outcome, NodeError> {
    let Value::Number(x) = &call.input else {
        return Err(invalid(format!(
            "math input must be a number, got {}",
            kind_name(&call.input)
        )));
    };
    let value = if cfg.operation.is_binary() {
        let y = cfg.operand.as_ref().ok_or_else(|| {
            invalid(format!("{:?} requires an operand", cfg.operation).to_lowercase())
        })?;
        binary(cfg.operation, x, y)?
    } else {
        unary(cfg.operation, x)?
    };
    Ok(Outcome::value(value))
}

fn to_value(v: f64) -> Result<Value, NodeError> {
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| invalid(format!("math produced a non-finite result ({v})")))
}

/// Integer results stay integers when exact; everything else is f64.
fn binary(op: MathOperation, x: &Number, y: &Number) -> Result<Value, NodeError> {
    use MathOperation::*;

    if matches!(op, Divide | Modulo) && y.as_f64() == Some(0.0) {
        return Err(invalid("division by zero"));
    }

    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            Add => a.checked_add(b),
            Subtract => a.checked_sub(b),
            Multiply => a.checked_mul(b),
            Divide if a.checked_rem(b) == Some(0) => a.checked_div(b),
            Modulo => a.checked_rem(b),
            Power => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            Min => Some(a.min(b)),
            Max => Some(a.max(b)),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let (a, b) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
    let v = match op {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide => a / b,
        Modulo => a % b,
        Power => a.powf(b),
        Min => a.min(b),
        Max => a.max(b),
        other => return Err(invalid(format!("{other:?} is not a binary operation"))),
    };
    to_value(v)
}

fn unary(op: MathOperation, x: &Number) -> Result<Value, NodeError> {
    use MathOperation::*;

    if let Some(a) = x.as_i64() {
        let exact = match op {
            Abs => a.checked_abs(),
            Negate => a.checked_neg(),
            Round | Floor | Ceil => Some(a),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let a = x.as_f64().unwrap_or(f64::NAN);
    let v = match op {
        Abs => a.abs(),
        Negate => -a,
        Round => a.round(),
        Floor => a.floor(),
        Ceil => a.ceil(),
        Sqrt if a < 0.0 => return Err(invalid(format!("sqrt of negative number {a}"))),
        Sqrt => a.sqrt(),
        other => return Err(invalid(format!("{other:?} is not a unary operation"))),
    };
    // Rounded floats that fit an integer are reported as integers.
    if matches!(op, Round | Floor | Ceil) && v.abs() < 9.0e15 {
        return Ok(Value::from(v as i64));
    }
    to_value(v)
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

fn expect_str<'v>(value: &'v Value, op: TextOperation) -> Result<&'v str, NodeError> {
    value.as_str().ok_or_else(|| {
        invalid(format!(
            "text {op:?} expects a string input, got {}",
            kind_name(value)
        ))
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn text(call: &NodeCall<'_>, cfg: &TextConfig) -> Result<Outcome, NodeError> {
    let op = cfg.operation;
    let input = &call.input;
    let value = match op {
        TextOperation::Uppercase => Value::from(expect_str(input, op)?.to_uppercase()),
        TextOperation::Lowercase => Value::from(expect_str(input, op)?.to_lowercase()),
        TextOperation::Trim => Value::from(expect_str(input, op)?.trim()),
        TextOperation::Length => Value::from(expect_str(input, op)?.chars().count()),
        TextOperation::Split => {
            let sep = cfg.separator.as_deref().unwrap_or(",");
            Value::Array(
                expect_str(input, op)?
                    .split(sep)
                    .map(Value::from)
                    .collect(),
            )
        }
        TextOperation::Concat | TextOperation::Join => {
            let default_sep = if op == TextOperation::Join { "," } else { "" };
            let sep = cfg.separator.as_deref().unwrap_or(default_sep);
            let Value::Array(items) = input else {
                return Err(invalid(format!(
                    "text {op:?} expects an array input, got {}",
                    kind_name(input)
                )));
            };
            Value::from(items.iter().map(display).collect::<Vec<_>>().join(sep))
        }
        TextOperation::Replace => {
            let pattern = cfg.pattern.as_deref().unwrap_or_default();
            if pattern.is_empty() {
                return Err(invalid("replace requires a non-empty pattern"));
            }
            let replacement = cfg.replacement.as_deref().unwrap_or_default();
            Value::from(expect_str(input, op)?.replace(pattern, replacement))
        }
        TextOperation::Template => {
            let template = cfg.template.as_deref().unwrap_or_default();
            let rendered =
                render_template(call.ctx.evaluator(), template, &call.bindings())
                    .map_err(|e| e.into_node_error(template))?;
            Value::from(rendered)
        }
    };
    Ok(Outcome::value(value))
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Sleep, then pass the input through. Cancellation ends the sleep early.
pub async fn delay(call: &NodeCall<'_>, cfg: &DelayConfig) -> Result<Outcome, NodeError> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(cfg.duration_ms)) => {
            Ok(Outcome::value(call.input.clone()))
        }
        _ = call.cancel.cancelled() => Err(NodeError::cancelled()),
    }
}
