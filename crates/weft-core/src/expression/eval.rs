//! Tree-walking evaluation over `serde_json::Value`.
//!
//! Type policy: operands of different kinds are never coerced. Comparing a
//! string with a number is a `TypeMismatch` error, not `false`. The single
//! exception is `null`, which may be tested with `==` / `!=` against anything.

use std::cmp::Ordering;

use serde_json::Value;

use super::parser::{BinaryOp, Expr, Segment, UnaryOp};
use super::{Bindings, ExpressionError};

/// Fields of `node.<id>` that address the result itself rather than its output.
const NODE_RESULT_FIELDS: &[&str] = &["output", "metadata", "status", "error", "attempts"];

pub fn evaluate(expr: &Expr, bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|e| evaluate(e, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Path { root, segments } => resolve_path(root, segments, bindings),
        Expr::Member { target, segment } => {
            let base = evaluate(target, bindings)?;
            let key = segment_key(segment, bindings)?;
            descend(&base, &key).cloned().ok_or_else(|| {
                ExpressionError::UnresolvedIdentifier(format!("<value>{}", key.display()))
            })
        }
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, bindings)?;
            match op {
                UnaryOp::Not => match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(ExpressionError::TypeMismatch(format!(
                        "'!' requires a boolean, got {}",
                        kind_name(&other)
                    ))),
                },
                UnaryOp::Neg => match &value {
                    Value::Number(n) => match n.as_i64() {
                        Some(i) if i != i64::MIN => Ok(Value::from(-i)),
                        _ => float(-n.as_f64().unwrap_or_default()),
                    },
                    other => Err(ExpressionError::TypeMismatch(format!(
                        "unary '-' requires a number, got {}",
                        kind_name(other)
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => binary(*op, left, right, bindings),
        Expr::Call { name, args } => call(name, args, bindings),
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Key {
    Field(String),
    Index(usize),
}

impl Key {
    fn display(&self) -> String {
        match self {
            Self::Field(f) => format!(".{f}"),
            Self::Index(i) => format!("[{i}]"),
        }
    }
}

fn segment_key(segment: &Segment, bindings: &dyn Bindings) -> Result<Key, ExpressionError> {
    match segment {
        Segment::Field(name) => Ok(Key::Field(name.clone())),
        Segment::Index(expr) => match evaluate(expr, bindings)? {
            Value::String(s) => Ok(Key::Field(s)),
            Value::Number(n) => n
                .as_u64()
                .map(|i| Key::Index(i as usize))
                .ok_or_else(|| {
                    ExpressionError::TypeMismatch(format!(
                        "array index must be a non-negative integer, got {n}"
                    ))
                }),
            other => Err(ExpressionError::TypeMismatch(format!(
                "index must be a string or integer, got {}",
                kind_name(&other)
            ))),
        },
    }
}

fn descend<'v>(value: &'v Value, key: &Key) -> Option<&'v Value> {
    match (value, key) {
        (Value::Object(map), Key::Field(f)) => map.get(f),
        (Value::Array(items), Key::Index(i)) => items.get(*i),
        _ => None,
    }
}

fn resolve_path(
    root: &str,
    segments: &[Segment],
    bindings: &dyn Bindings,
) -> Result<Value, ExpressionError> {
    let keys = segments
        .iter()
        .map(|s| segment_key(s, bindings))
        .collect::<Result<Vec<_>, _>>()?;
    let mut shown = root.to_string();

    let (base, rest) = if root == "node" {
        // node.<id>.<field>; any other field reads into the node's output
        let (Some(Key::Field(id)), rest) = (keys.first(), keys.get(1..).unwrap_or_default())
        else {
            return Err(ExpressionError::UnresolvedIdentifier(
                "node (expected node.<id>.<field>)".to_string(),
            ));
        };
        shown.push_str(&format!(".{id}"));
        match rest.first() {
            Some(Key::Field(field)) if NODE_RESULT_FIELDS.contains(&field.as_str()) => {
                shown.push_str(&format!(".{field}"));
                let value = bindings
                    .node_field(id, field)
                    .ok_or_else(|| ExpressionError::UnresolvedIdentifier(shown.clone()))?;
                (value, &rest[1..])
            }
            _ => {
                let value = bindings
                    .node_field(id, "output")
                    .ok_or_else(|| ExpressionError::UnresolvedIdentifier(shown.clone()))?;
                (value, rest)
            }
        }
    } else {
        let value = bindings
            .root(root)
            .ok_or_else(|| ExpressionError::UnresolvedIdentifier(root.to_string()))?;
        (value, keys.as_slice())
    };

    if rest.is_empty() {
        return Ok(base);
    }

    let mut current = &base;
    for key in rest {
        shown.push_str(&key.display());
        current = descend(current, key)
            .ok_or_else(|| ExpressionError::UnresolvedIdentifier(shown.clone()))?;
    }
    Ok(current.clone())
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

fn binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    bindings: &dyn Bindings,
) -> Result<Value, ExpressionError> {
    // Short-circuit logic, both sides must be booleans when evaluated.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = expect_bool(op, evaluate(left, bindings)?)?;
        if (op == BinaryOp::And && !l) || (op == BinaryOp::Or && l) {
            return Ok(Value::Bool(l));
        }
        let r = expect_bool(op, evaluate(right, bindings)?)?;
        return Ok(Value::Bool(r));
    }

    let l = evaluate(left, bindings)?;
    let r = evaluate(right, bindings)?;

    match op {
        BinaryOp::Eq => equals(&l, &r).map(Value::Bool),
        BinaryOp::NotEq => equals(&l, &r).map(|b| Value::Bool(!b)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(op, &l, &r)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, &l, &r),
        },
        _ => arithmetic(op, &l, &r),
    }
}

fn expect_bool(op: BinaryOp, value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch(format!(
            "'{}' requires booleans, got {}",
            op.symbol(),
            kind_name(&other)
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(ExpressionError::TypeMismatch(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            kind_name(l),
            kind_name(r)
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div if x.checked_rem(y) == Some(0) => x.checked_div(y),
            BinaryOp::Rem => x.checked_rem(y),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    let v = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    float(v)
}

/// Typed equality. Numbers compare numerically; `null` equals only `null`.
pub fn equals(l: &Value, r: &Value) -> Result<bool, ExpressionError> {
    match (l, r) {
        (Value::Null, _) | (_, Value::Null) => Ok(l.is_null() && r.is_null()),
        _ if kind_name(l) != kind_name(r) => Err(ExpressionError::TypeMismatch(format!(
            "cannot compare {} with {}",
            kind_name(l),
            kind_name(r)
        ))),
        _ => Ok(loose_eq(l, r)),
    }
}

/// Structural equality without errors: values of different kinds are unequal.
pub fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| loose_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| loose_eq(v, other)))
        }
        _ => l == r,
    }
}

/// Ordering for numbers and strings. Anything else is a type mismatch.
pub fn compare_values(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Ordering, ExpressionError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            compare_values(l, r).ok_or_else(|| {
                ExpressionError::TypeMismatch(format!("cannot order {l} and {r}"))
            })
        }
        _ => Err(ExpressionError::TypeMismatch(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            kind_name(l),
            kind_name(r)
        ))),
    }
}

fn float(v: f64) -> Result<Value, ExpressionError> {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::TypeMismatch(format!("non-finite result {v}")))
}

pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

fn call(name: &str, args: &[Expr], bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
    // `exists` inspects resolution failure instead of propagating it.
    if name == "exists" {
        let [arg] = args else {
            return Err(arity(name, 1, args.len()));
        };
        return match evaluate(arg, bindings) {
            Ok(_) => Ok(Value::Bool(true)),
            Err(ExpressionError::UnresolvedIdentifier(_)) => Ok(Value::Bool(false)),
            Err(e) => Err(e),
        };
    }

    let values = args
        .iter()
        .map(|a| evaluate(a, bindings))
        .collect::<Result<Vec<_>, _>>()?;

    match (name, values.as_slice()) {
        ("length" | "len", [v]) => match v {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => Err(bad_arg(name, other)),
        },
        ("lower", [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
        ("upper", [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
        ("trim", [Value::String(s)]) => Ok(Value::String(s.trim().to_string())),
        ("contains", [Value::String(s), Value::String(needle)]) => {
            Ok(Value::Bool(s.contains(needle.as_str())))
        }
        ("contains", [Value::Array(items), needle]) => {
            Ok(Value::Bool(items.iter().any(|i| loose_eq(i, needle))))
        }
        ("startsWith" | "starts_with", [Value::String(s), Value::String(p)]) => {
            Ok(Value::Bool(s.starts_with(p.as_str())))
        }
        ("endsWith" | "ends_with", [Value::String(s), Value::String(p)]) => {
            Ok(Value::Bool(s.ends_with(p.as_str())))
        }
        ("split", [Value::String(s), Value::String(sep)]) => Ok(Value::Array(
            s.split(sep.as_str())
                .map(|p| Value::String(p.to_string()))
                .collect(),
        )),
        ("keys", [Value::Object(map)]) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        ("string", [v]) => Ok(Value::String(match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ("abs", [Value::Number(n)]) => match n.as_i64() {
            Some(i) => Ok(Value::from(i.saturating_abs())),
            None => float(n.as_f64().unwrap_or_default().abs()),
        },
        ("floor" | "ceil" | "round", [Value::Number(n)]) => {
            if n.is_i64() || n.is_u64() {
                return Ok(Value::Number(n.clone()));
            }
            let x = n.as_f64().unwrap_or_default();
            let y = match name {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.round(),
            };
            Ok(integral(y))
        }
        ("min" | "max", values) if !values.is_empty() => {
            let items = match values {
                [Value::Array(items)] => items.as_slice(),
                other => other,
            };
            let mut best: Option<&Value> = None;
            for item in items {
                if !item.is_number() {
                    return Err(bad_arg(name, item));
                }
                best = match best {
                    None => Some(item),
                    Some(b) => {
                        let ord = compare_values(item, b).unwrap_or(Ordering::Equal);
                        let take = if name == "min" {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        };
                        Some(if take { item } else { b })
                    }
                };
            }
            Ok(best.cloned().unwrap_or(Value::Null))
        }
        (
            "length" | "len" | "lower" | "upper" | "trim" | "contains" | "startsWith"
            | "starts_with" | "endsWith" | "ends_with" | "split" | "keys" | "string" | "abs"
            | "floor" | "ceil" | "round" | "min" | "max",
            values,
        ) => match values.first() {
            Some(first) => Err(bad_arg(name, first)),
            None => Err(arity(name, 1, 0)),
        },
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

fn integral(v: f64) -> Value {
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn bad_arg(name: &str, value: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch(format!(
        "invalid argument of type {} for '{name}'",
        kind_name(value)
    ))
}

fn arity(name: &str, expected: usize, got: usize) -> ExpressionError {
    ExpressionError::TypeMismatch(format!(
        "'{name}' expects {expected} argument(s), got {got}"
    ))
}
