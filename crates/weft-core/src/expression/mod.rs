//! Expression evaluator for conditions, predicates and templates.
//!
//! Expressions are small and side-effect free:
//! `input.age >= 18 && node.lookup.status == 'completed'`.
//! Parsed trees are cached by source text so predicates evaluated once per
//! array element are only parsed once.
//!
//! **Type policy:** no implicit coercion. Comparing values of different kinds
//! (`"200" == 200`) is a [`ExpressionError::TypeMismatch`], and referencing a
//! name or field that does not exist is an
//! [`ExpressionError::UnresolvedIdentifier`]. `null` compares equal only to
//! `null` and may be tested against any kind with `==` / `!=`.

mod eval;
mod lexer;
mod parser;
mod template;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use weft_types::error::NodeError;

pub use eval::{compare_values, equals, kind_name, loose_eq};
pub use parser::{Expr, parse};
pub use template::render_template;

/// Parsed trees kept before the cache is reset.
const MAX_CACHED_EXPRESSIONS: usize = 4096;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unresolved identifier '{0}'")]
    UnresolvedIdentifier(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("expression did not evaluate to a boolean: got {0}")]
    NotBoolean(Value),
}

impl ExpressionError {
    /// Attach the source text and convert into a node-level evaluation error.
    pub fn into_node_error(self, expression: &str) -> NodeError {
        NodeError::evaluation(self.to_string(), expression)
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// Read-only view of the names an expression can reference.
pub trait Bindings {
    /// Value bound to a top-level name such as `input`, `item` or `variables`.
    fn root(&self, name: &str) -> Option<Value>;

    /// A field of a node's recorded result (`output`, `metadata`, `status`,
    /// `error`, `attempts`). `None` if the node has no result this run.
    fn node_field(&self, node_id: &str, field: &str) -> Option<Value>;
}

/// A JSON object whose keys are the root names. `node.<id>.<field>` reads
/// from the `node` key.
impl Bindings for Value {
    fn root(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }

    fn node_field(&self, node_id: &str, field: &str) -> Option<Value> {
        self.get("node")?.get(node_id)?.get(field).cloned()
    }
}

/// Extra names layered over another set of bindings (`item`, `index`, `acc`).
pub struct Scoped<'a> {
    parent: &'a dyn Bindings,
    names: Vec<(&'static str, Value)>,
}

impl<'a> Scoped<'a> {
    pub fn new(parent: &'a dyn Bindings) -> Self {
        Self {
            parent,
            names: Vec::new(),
        }
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.names.push((name, value));
        self
    }

    pub fn set(&mut self, name: &'static str, value: Value) {
        match self.names.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.names.push((name, value)),
        }
    }
}

impl Bindings for Scoped<'_> {
    fn root(&self, name: &str) -> Option<Value> {
        self.names
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .or_else(|| self.parent.root(name))
    }

    fn node_field(&self, node_id: &str, field: &str) -> Option<Value> {
        self.parent.node_field(node_id, field)
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Parses and evaluates expressions, caching parsed trees by source text.
#[derive(Default)]
pub struct ExpressionEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse (or fetch from cache) the tree for `source`.
    pub fn compile(&self, source: &str) -> Result<Arc<Expr>, ExpressionError> {
        if let Some(expr) = self.cache.get(source) {
            return Ok(Arc::clone(expr.value()));
        }
        let expr = Arc::new(parse(source)?);
        if self.cache.len() >= MAX_CACHED_EXPRESSIONS {
            self.cache.clear();
        }
        self.cache.insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Evaluate an expression and return its value.
    pub fn evaluate(&self, source: &str, bindings: &dyn Bindings) -> Result<Value, ExpressionError> {
        let expr = self.compile(source)?;
        eval::evaluate(&expr, bindings)
    }

    /// Evaluate an expression that must produce a boolean. No truthiness
    /// coercion is applied.
    pub fn evaluate_bool(
        &self,
        source: &str,
        bindings: &dyn Bindings,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(source, bindings)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean(other)),
        }
    }

    /// Evaluate and convert failures into a node error carrying the source.
    pub fn evaluate_for_node(
        &self,
        source: &str,
        bindings: &dyn Bindings,
    ) -> Result<Value, NodeError> {
        self.evaluate(source, bindings)
            .map_err(|e| e.into_node_error(source))
    }

    /// Boolean variant of [`Self::evaluate_for_node`].
    pub fn evaluate_bool_for_node(
        &self,
        source: &str,
        bindings: &dyn Bindings,
    ) -> Result<bool, NodeError> {
        self.evaluate_bool(source, bindings)
            .map_err(|e| e.into_node_error(source))
    }

    /// Number of cached trees.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    fn ctx() -> Value {
        json!({
            "input": {
                "age": 18,
                "name": "Alice",
                "tags": ["rust", "wasm"],
                "score": 7.5,
                "status_code": "200",
                "missing": null
            },
            "variables": { "limit": 10 },
            "context": { "env": "prod" },
            "node": {
                "fetch": {
                    "output": { "items": [1, 2, 3] },
                    "status": "completed",
                    "metadata": { "attempts": 2 }
                }
            }
        })
    }

    // -------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------

    #[test]
    fn test_dot_notation_and_indexing() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("input.name", &ctx()).unwrap(), json!("Alice"));
        assert_eq!(eval.evaluate("input.tags[1]", &ctx()).unwrap(), json!("wasm"));
        assert_eq!(eval.evaluate("input['age']", &ctx()).unwrap(), json!(18));
        assert_eq!(eval.evaluate("variables.limit", &ctx()).unwrap(), json!(10));
        assert_eq!(eval.evaluate("context.env", &ctx()).unwrap(), json!("prod"));
    }

    #[test]
    fn test_node_fields() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("node.fetch.status", &ctx()).unwrap(),
            json!("completed")
        );
        assert_eq!(
            eval.evaluate("node.fetch.output.items[2]", &ctx()).unwrap(),
            json!(3)
        );
        // Shorthand: unknown result fields read into the output.
        assert_eq!(
            eval.evaluate("node.fetch.items[0]", &ctx()).unwrap(),
            json!(1)
        );
        assert_eq!(
            eval.evaluate("node.fetch.metadata.attempts", &ctx()).unwrap(),
            json!(2)
        );
    }

    #[test]
    fn test_unresolved_identifiers_are_errors() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("nope > 1", &ctx()).unwrap_err(),
            ExpressionError::UnresolvedIdentifier("nope".into())
        );
        assert_eq!(
            eval.evaluate("input.address.city", &ctx()).unwrap_err(),
            ExpressionError::UnresolvedIdentifier("input.address".into())
        );
        assert!(matches!(
            eval.evaluate("node.ghost.output", &ctx()).unwrap_err(),
            ExpressionError::UnresolvedIdentifier(_)
        ));
        assert!(matches!(
            eval.evaluate("input.tags[5]", &ctx()).unwrap_err(),
            ExpressionError::UnresolvedIdentifier(_)
        ));
    }

    // -------------------------------------------------------------------
    // Operators
    // -------------------------------------------------------------------

    #[test]
    fn test_arithmetic_precedence() {
        let eval = evaluator();
        let v = json!({});
        assert_eq!(eval.evaluate("1 + 2 * 3", &v).unwrap(), json!(7));
        assert_eq!(eval.evaluate("(1 + 2) * 3", &v).unwrap(), json!(9));
        assert_eq!(eval.evaluate("10 % 4", &v).unwrap(), json!(2));
        assert_eq!(eval.evaluate("7 / 2", &v).unwrap(), json!(3.5));
        assert_eq!(eval.evaluate("8 / 2", &v).unwrap(), json!(4));
        assert_eq!(eval.evaluate("-3 + 1", &v).unwrap(), json!(-2));
        assert_eq!(eval.evaluate("1.5 * 2", &v).unwrap(), json!(3.0));
    }

    #[test]
    fn test_string_and_array_concat() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("input.name + '!'", &ctx()).unwrap(),
            json!("Alice!")
        );
        assert_eq!(
            eval.evaluate("input.tags + ['go']", &ctx()).unwrap(),
            json!(["rust", "wasm", "go"])
        );
    }

    #[test]
    fn test_comparisons() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("input.age >= 18", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("input.age > 18", &ctx()).unwrap());
        assert!(eval.evaluate_bool("input.score < 8", &ctx()).unwrap());
        assert!(eval.evaluate_bool("input.name == 'Alice'", &ctx()).unwrap());
        assert!(eval.evaluate_bool("'abc' < 'abd'", &json!({})).unwrap());
        assert!(eval.evaluate_bool("18 == 18.0", &json!({})).unwrap());
    }

    #[test]
    fn test_cross_type_comparison_is_an_error() {
        let eval = evaluator();
        let err = eval
            .evaluate_bool("input.status_code == 200", &ctx())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));

        let err = eval.evaluate("'a' < 1", &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));

        let err = eval.evaluate("'a' - 1", &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::TypeMismatch(_)));
    }

    #[test]
    fn test_null_equality_is_allowed() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("input.missing == null", &ctx()).unwrap());
        assert!(eval.evaluate_bool("input.name != null", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("input.age == null", &ctx()).unwrap());
    }

    #[test]
    fn test_logical_operators_require_booleans() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("true && !false", &json!({})).unwrap());
        assert!(eval.evaluate_bool("false || true", &json!({})).unwrap());
        assert!(matches!(
            eval.evaluate("1 && true", &json!({})).unwrap_err(),
            ExpressionError::TypeMismatch(_)
        ));
        assert!(matches!(
            eval.evaluate("!'yes'", &json!({})).unwrap_err(),
            ExpressionError::TypeMismatch(_)
        ));
    }

    #[test]
    fn test_short_circuit_skips_right_side() {
        let eval = evaluator();
        assert!(!eval.evaluate_bool("false && nope", &json!({})).unwrap());
        assert!(eval.evaluate_bool("true || nope", &json!({})).unwrap());
    }

    #[test]
    fn test_division_by_zero() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("1 / 0", &json!({})).unwrap_err(),
            ExpressionError::DivisionByZero
        );
        assert_eq!(
            eval.evaluate("1.5 % 0", &json!({})).unwrap_err(),
            ExpressionError::DivisionByZero
        );
    }

    #[test]
    fn test_evaluate_bool_rejects_non_boolean() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_bool("input.age", &ctx()).unwrap_err(),
            ExpressionError::NotBoolean(json!(18))
        );
    }

    // -------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------

    #[test]
    fn test_transforms() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("input.tags|length", &ctx()).unwrap(), json!(2));
        assert_eq!(eval.evaluate("upper(input.name)", &ctx()).unwrap(), json!("ALICE"));
        assert!(eval
            .evaluate_bool("input.tags|contains('rust')", &ctx())
            .unwrap());
        assert!(eval
            .evaluate_bool("input.name|startsWith('Al')", &ctx())
            .unwrap());
        assert_eq!(eval.evaluate("max(3, 9, 4)", &json!({})).unwrap(), json!(9));
        assert_eq!(eval.evaluate("round(2.6)", &json!({})).unwrap(), json!(3));
        assert!(matches!(
            eval.evaluate("shout(1)", &json!({})).unwrap_err(),
            ExpressionError::UnknownFunction(_)
        ));
    }

    #[test]
    fn test_exists_checks_resolution() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("exists(input.name)", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("exists(input.address.city)", &ctx()).unwrap());
    }

    // -------------------------------------------------------------------
    // Scoped bindings and caching
    // -------------------------------------------------------------------

    #[test]
    fn test_scoped_bindings_shadow_parent() {
        let eval = evaluator();
        let parent = ctx();
        let scoped = Scoped::new(&parent)
            .with("item", json!({"price": 4}))
            .with("index", json!(1));
        assert_eq!(
            eval.evaluate("item.price * variables.limit + index", &scoped)
                .unwrap(),
            json!(41)
        );
    }

    #[test]
    fn test_parsed_expressions_are_cached() {
        let eval = evaluator();
        eval.evaluate("1 + 1", &json!({})).unwrap();
        eval.evaluate("1 + 1", &json!({})).unwrap();
        eval.evaluate("2 + 2", &json!({})).unwrap();
        assert_eq!(eval.cached(), 2);
    }

    #[test]
    fn test_node_error_carries_expression_text() {
        let eval = evaluator();
        let err = eval
            .evaluate_for_node("input.nope > 1", &ctx())
            .unwrap_err();
        assert_eq!(err.kind, weft_types::error::ErrorKind::Evaluation);
        assert_eq!(err.expression.as_deref(), Some("input.nope > 1"));
    }
}
