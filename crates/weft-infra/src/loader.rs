//! Workflow definition loading.
//!
//! Workflows are stored as JSON or YAML using the serde model in
//! `weft_types::workflow`. Loading always validates: a returned workflow has
//! unique ids, resolvable edges, well-formed switches and an acyclic graph
//! whose scoped bodies nest cleanly.

use std::path::Path;

use weft_core::workflow::{ExecutionPlan, ValidationError};
use weft_types::workflow::Workflow;

/// Errors loading a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read workflow: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse workflow: {0}")]
    Parse(String),

    #[error("unsupported workflow file extension: '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Serialization format of a workflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Json,
    Yaml,
}

impl WorkflowFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(LoadError::UnsupportedFormat(ext)),
        }
    }
}

/// Parse and validate a workflow definition.
pub fn parse_workflow(content: &str, format: WorkflowFormat) -> Result<Workflow, LoadError> {
    let workflow: Workflow = match format {
        WorkflowFormat::Json => {
            serde_json::from_str(content).map_err(|e| LoadError::Parse(e.to_string()))?
        }
        WorkflowFormat::Yaml => {
            serde_yaml_ng::from_str(content).map_err(|e| LoadError::Parse(e.to_string()))?
        }
    };
    ExecutionPlan::build(&workflow)?;
    Ok(workflow)
}

/// Load and validate a workflow file. The format follows the extension.
pub async fn load_workflow(path: &Path) -> Result<Workflow, LoadError> {
    let format = WorkflowFormat::from_path(path)?;
    let content = tokio::fs::read_to_string(path).await?;
    let workflow = parse_workflow(&content, format)?;
    tracing::debug!(
        path = %path.display(),
        workflow_id = workflow.id.as_str(),
        nodes = workflow.nodes.len(),
        edges = workflow.edges.len(),
        "workflow loaded"
    );
    Ok(workflow)
}

/// Serialize a workflow in the given format.
pub fn serialize_workflow(workflow: &Workflow, format: WorkflowFormat) -> Result<String, LoadError> {
    match format {
        WorkflowFormat::Json => {
            serde_json::to_string_pretty(workflow).map_err(|e| LoadError::Parse(e.to_string()))
        }
        WorkflowFormat::Yaml => {
            serde_yaml_ng::to_string(workflow).map_err(|e| LoadError::Parse(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use weft_types::node::NodeKind;

    const AGE_CHECK: &str = r#"
id: age-check
name: Age check
nodes:
  - id: age
    type: input
    data:
      field: age
  - id: check
    type: condition
    data:
      expression: "input >= 18"
  - id: adult
    type: output
    data: {}
  - id: minor
    type: output
    data: {}
edges:
  - source: age
    target: check
  - source: check
    source_handle: "true"
    target: adult
  - source: check
    source_handle: "false"
    target: minor
"#;

    #[tokio::test]
    async fn loads_yaml_workflow() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("age.yaml");
        tokio::fs::write(&path, AGE_CHECK).await.unwrap();

        let workflow = load_workflow(&path).await.unwrap();
        assert_eq!(workflow.id, "age-check");
        assert_eq!(workflow.nodes.len(), 4);
        assert!(matches!(
            &workflow.node("check").unwrap().kind,
            NodeKind::Condition(c) if c.expression == "input >= 18"
        ));
        assert_eq!(workflow.edges[1].source_handle.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn loads_json_workflow() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("age.json");
        let workflow = parse_workflow(AGE_CHECK, WorkflowFormat::Yaml).unwrap();
        let json = serialize_workflow(&workflow, WorkflowFormat::Json).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        assert_eq!(load_workflow(&path).await.unwrap(), workflow);
    }

    #[test]
    fn rejects_invalid_workflow() {
        let yaml = r#"
id: broken
nodes:
  - id: a
    type: constant
    data: { value: 1 }
edges:
  - source: a
    target: ghost
"#;
        let err = parse_workflow(yaml, WorkflowFormat::Yaml).unwrap_err();
        assert!(matches!(err, LoadError::Invalid(ValidationError::DanglingEdge { .. })));
    }

    #[test]
    fn rejects_unknown_node_type() {
        let json = r#"{"id": "w", "nodes": [{"id": "a", "type": "teleport", "data": {}}]}"#;
        let err = parse_workflow(json, WorkflowFormat::Json).unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_extension() {
        let err = load_workflow(Path::new("flow.txt")).await.unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(ext) if ext == "txt"));
    }
}
