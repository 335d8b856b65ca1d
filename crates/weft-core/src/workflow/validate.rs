//! Structural validation of a workflow before any node runs.
//!
//! Checks performed here are purely structural: unique ids, edge endpoints,
//! switch default placement and required per-kind configuration. Cycle
//! detection and scope nesting are checked while building the
//! [`ExecutionPlan`](super::graph::ExecutionPlan). Expression syntax is not
//! checked here; a malformed expression fails at the node that evaluates it.

use std::collections::HashSet;

use weft_types::node::{MathConfig, NodeKind, TextConfig, TextOperation};
use weft_types::workflow::{Node, Workflow};

/// A workflow that cannot be executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("duplicate node id: '{0}'")]
    DuplicateNodeId(String),

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("switch '{node_id}': {message}")]
    SwitchDefault { node_id: String, message: String },

    #[error("node '{node_id}' is missing configuration: {message}")]
    MissingConfig { node_id: String, message: String },

    #[error("bodies of '{first}' and '{second}' overlap without nesting")]
    OverlappingScopes { first: String, second: String },

    #[error("sink '{0}' does not exist")]
    UnknownSink(String),
}

/// Validate ids, edges and node configuration.
pub fn validate_structure(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    for edge in &workflow.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                return Err(ValidationError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    for node in &workflow.nodes {
        validate_node(node)?;
    }
    Ok(())
}

fn missing(node: &Node, message: impl Into<String>) -> ValidationError {
    ValidationError::MissingConfig {
        node_id: node.id.clone(),
        message: message.into(),
    }
}

fn require_text(node: &Node, field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(missing(node, format!("'{field}' must not be empty")));
    }
    Ok(())
}

fn validate_node(node: &Node) -> Result<(), ValidationError> {
    match &node.kind {
        NodeKind::Switch(cfg) => validate_switch(node, cfg),
        NodeKind::Condition(cfg) => require_text(node, "expression", &cfg.expression),
        NodeKind::WhileLoop(cfg) => require_text(node, "condition", &cfg.condition),
        NodeKind::Partition(cfg)
        | NodeKind::Filter(cfg)
        | NodeKind::Map(cfg)
        | NodeKind::FlatMap(cfg)
        | NodeKind::Find(cfg) => require_text(node, "expression", &cfg.expression),
        NodeKind::Reduce(cfg) => require_text(node, "expression", &cfg.expression),
        NodeKind::GroupBy(cfg) => require_text(node, "key", &cfg.key),
        NodeKind::Math(cfg) => validate_math(node, cfg),
        NodeKind::Text(cfg) => validate_text(node, cfg),
        NodeKind::Split(cfg) if cfg.paths.is_empty() => {
            Err(missing(node, "'paths' must name at least one output path"))
        }
        NodeKind::Parallel(cfg) if cfg.max_concurrency == Some(0) => {
            Err(missing(node, "'max_concurrency' must be at least 1"))
        }
        NodeKind::Chunk(cfg) if cfg.size == 0 => Err(missing(node, "'size' must be at least 1")),
        NodeKind::Range(cfg) if cfg.step == 0 => Err(missing(node, "'step' must not be 0")),
        NodeKind::Retry(cfg) if cfg.max_attempts == 0 => {
            Err(missing(node, "'max_attempts' must be at least 1"))
        }
        NodeKind::Retry(cfg) if !(cfg.multiplier.is_finite() && cfg.multiplier >= 1.0) => {
            Err(missing(node, "'multiplier' must be a finite number >= 1"))
        }
        NodeKind::Timeout(cfg) if cfg.timeout_ms == 0 => {
            Err(missing(node, "'timeout_ms' must be greater than 0"))
        }
        NodeKind::Variable(cfg) => require_text(node, "name", &cfg.name),
        NodeKind::Cache(cfg) => {
            require_text(node, "key", &cfg.key)?;
            if cfg.max_size == Some(0) {
                return Err(missing(node, "'max_size' must be at least 1"));
            }
            Ok(())
        }
        NodeKind::Http(cfg) => {
            require_text(node, "url", &cfg.url)?;
            require_text(node, "method", &cfg.method)
        }
        _ => Ok(()),
    }
}

fn validate_switch(
    node: &Node,
    cfg: &weft_types::node::SwitchConfig,
) -> Result<(), ValidationError> {
    let err = |message: &str| ValidationError::SwitchDefault {
        node_id: node.id.clone(),
        message: message.to_string(),
    };

    let defaults = cfg.cases.iter().filter(|c| c.is_default).count();
    if defaults != 1 {
        return Err(err(&format!(
            "exactly one case must be marked default, found {defaults}"
        )));
    }
    if !cfg.cases.last().is_some_and(|c| c.is_default) {
        return Err(err("the default case must be the last case"));
    }

    for (i, case) in cfg.cases.iter().enumerate() {
        if case.is_default {
            continue;
        }
        if case.value.is_none() && case.when.is_none() {
            return Err(missing(
                node,
                format!("case {i} needs either 'value' or 'when'"),
            ));
        }
        if case.value.is_some() && case.when.is_some() {
            return Err(missing(
                node,
                format!("case {i} sets both 'value' and 'when'"),
            ));
        }
        if case.output_path.as_deref().is_none_or(str::is_empty) {
            return Err(missing(node, format!("case {i} needs an 'output_path'")));
        }
    }
    Ok(())
}

fn validate_math(node: &Node, cfg: &MathConfig) -> Result<(), ValidationError> {
    if cfg.operation.is_binary() && cfg.operand.is_none() {
        return Err(missing(
            node,
            format!("'{:?}' requires an 'operand'", cfg.operation).to_lowercase(),
        ));
    }
    Ok(())
}

fn validate_text(node: &Node, cfg: &TextConfig) -> Result<(), ValidationError> {
    match cfg.operation {
        TextOperation::Replace if cfg.pattern.as_deref().is_none_or(str::is_empty) => {
            Err(missing(node, "'replace' requires a non-empty 'pattern'"))
        }
        TextOperation::Template if cfg.template.is_none() => {
            Err(missing(node, "'template' requires a 'template'"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::node::{
        ConstantConfig, MathOperation, RangeConfig, SwitchCase, SwitchConfig,
    };
    use weft_types::workflow::Edge;

    fn constant(id: &str) -> Node {
        Node::new(id, NodeKind::Constant(ConstantConfig { value: json!(1) }))
    }

    fn switch(cases: Vec<SwitchCase>) -> Workflow {
        Workflow::new("wf").with_node(Node::new(
            "sw",
            NodeKind::Switch(SwitchConfig { field: None, cases }),
        ))
    }

    fn case(value: i64, path: &str) -> SwitchCase {
        SwitchCase {
            value: Some(json!(value)),
            output_path: Some(path.to_string()),
            ..Default::default()
        }
    }

    fn default_case() -> SwitchCase {
        SwitchCase {
            is_default: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let wf = Workflow::new("wf")
            .with_node(constant("a"))
            .with_node(constant("a"));
        assert_eq!(
            validate_structure(&wf).unwrap_err(),
            ValidationError::DuplicateNodeId("a".into())
        );
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let wf = Workflow::new("wf")
            .with_node(constant("a"))
            .with_edge(Edge::new("a", "ghost"));
        assert!(matches!(
            validate_structure(&wf).unwrap_err(),
            ValidationError::DanglingEdge { missing, .. } if missing == "ghost"
        ));
    }

    #[test]
    fn test_switch_with_trailing_default_is_valid() {
        let wf = switch(vec![case(200, "success"), case(404, "not_found"), default_case()]);
        assert!(validate_structure(&wf).is_ok());
    }

    #[test]
    fn test_switch_without_default_rejected() {
        let wf = switch(vec![case(200, "success")]);
        assert!(matches!(
            validate_structure(&wf).unwrap_err(),
            ValidationError::SwitchDefault { .. }
        ));
    }

    #[test]
    fn test_switch_default_not_last_rejected() {
        let wf = switch(vec![default_case(), case(200, "success")]);
        let err = validate_structure(&wf).unwrap_err();
        assert!(err.to_string().contains("last"));
    }

    #[test]
    fn test_switch_with_two_defaults_rejected() {
        let wf = switch(vec![case(1, "a"), default_case(), default_case()]);
        assert!(matches!(
            validate_structure(&wf).unwrap_err(),
            ValidationError::SwitchDefault { .. }
        ));
    }

    #[test]
    fn test_switch_case_needs_value_or_when() {
        let wf = switch(vec![
            SwitchCase {
                output_path: Some("x".into()),
                ..Default::default()
            },
            default_case(),
        ]);
        assert!(matches!(
            validate_structure(&wf).unwrap_err(),
            ValidationError::MissingConfig { .. }
        ));
    }

    #[test]
    fn test_binary_math_requires_operand() {
        let wf = Workflow::new("wf").with_node(Node::new(
            "m",
            NodeKind::Math(MathConfig {
                operation: MathOperation::Add,
                operand: None,
            }),
        ));
        let err = validate_structure(&wf).unwrap_err();
        assert!(err.to_string().contains("operand"));
    }

    #[test]
    fn test_zero_range_step_rejected() {
        let wf = Workflow::new("wf").with_node(Node::new(
            "r",
            NodeKind::Range(RangeConfig {
                start: 0,
                end: 5,
                step: 0,
            }),
        ));
        assert!(validate_structure(&wf).is_err());
    }
}
