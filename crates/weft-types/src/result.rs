//! Per-node results and the run report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NodeError;

// ---------------------------------------------------------------------------
// Node result
// ---------------------------------------------------------------------------

/// Lifecycle state of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    /// Not invoked: no live path reached the node.
    Skipped,
    Failed,
    /// Abandoned by a join or timeout after another branch won.
    Cancelled,
}

impl NodeStatus {
    /// The node will not change state again in this run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// What a node produced in one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    /// The data-flow value seen by downstream nodes.
    pub output: serde_json::Value,
    /// Per-handle values; an edge leaving handle `h` carries `handle_outputs[h]`
    /// when present, otherwise `output`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub handle_outputs: BTreeMap<String, serde_json::Value>,
    /// Handles whose edges are live. `None` means every outgoing edge is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_handles: Option<Vec<String>>,
    /// Observability data (chosen path, attempts, partial flags, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Set for failed nodes and for try/catch nodes that recovered an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl NodeResult {
    /// A completed result with the given output and every edge live.
    pub fn completed(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Completed,
            output,
            handle_outputs: BTreeMap::new(),
            selected_handles: None,
            metadata: serde_json::Map::new(),
            error: None,
            attempts: 1,
            started_at: None,
            duration_ms: 0,
        }
    }

    /// A failed result carrying the error.
    pub fn failed(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        error: NodeError,
    ) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(error),
            ..Self::completed(node_id, node_type, serde_json::Value::Null)
        }
    }

    /// Value carried by an edge leaving `handle`.
    pub fn value_for_handle(&self, handle: Option<&str>) -> &serde_json::Value {
        handle
            .and_then(|h| self.handle_outputs.get(h))
            .unwrap_or(&self.output)
    }

    /// The handle selected by a condition or switch, if any.
    pub fn selected_path(&self) -> Option<&str> {
        self.metadata.get("path").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Everything a caller can inspect after a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// UUIDv7 run id.
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Aggregated sink value(s).
    pub output: serde_json::Value,
    /// Results of invoked nodes only. Skipped nodes have no entry.
    pub results: BTreeMap<String, NodeResult>,
    /// Final state of every node, including skipped ones.
    pub node_states: BTreeMap<String, NodeStatus>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).copied()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn value_for_handle_prefers_handle_output() {
        let mut result = NodeResult::completed("p", "partition", json!({"matching": [1]}));
        result.handle_outputs.insert("matching".to_string(), json!([1]));

        assert_eq!(result.value_for_handle(Some("matching")), &json!([1]));
        assert_eq!(
            result.value_for_handle(Some("other")),
            &json!({"matching": [1]})
        );
        assert_eq!(result.value_for_handle(None), &json!({"matching": [1]}));
    }

    #[test]
    fn failed_result_serializes_error() {
        let result = NodeResult::failed(
            "n",
            "math",
            NodeError::new(ErrorKind::Evaluation, "division by zero"),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["kind"], "evaluation");
        assert!(value.get("handle_outputs").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::Cancelled.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }
}
