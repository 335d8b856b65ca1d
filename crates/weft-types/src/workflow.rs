//! Workflow graph model.
//!
//! A `Workflow` is the contract between whatever produced the graph (a file
//! loader, an editor, a test) and the engine. The engine never mutates it;
//! all run state lives in the per-run execution context.

use serde::{Deserialize, Serialize};

use crate::node::NodeKind;

// ---------------------------------------------------------------------------
// Well-known handle names
// ---------------------------------------------------------------------------

/// Handle selected by a condition that evaluated to `true`.
pub const HANDLE_TRUE: &str = "true";
/// Handle selected by a condition that evaluated to `false`.
pub const HANDLE_FALSE: &str = "false";
/// Default output path of a switch.
pub const HANDLE_DEFAULT: &str = "default";
/// Edges leaving a scoped node (loop, retry, try/catch, timeout) into its body.
pub const HANDLE_BODY: &str = "body";
/// Try/catch continuation taken when the body succeeded.
pub const HANDLE_SUCCESS: &str = "success";
/// Default try/catch continuation taken when the body failed.
pub const HANDLE_ERROR: &str = "error";
/// Partition output carrying elements that matched the predicate.
pub const HANDLE_MATCHING: &str = "matching";
/// Partition output carrying elements that did not match the predicate.
pub const HANDLE_NON_MATCHING: &str = "non_matching";
/// First array port of a zip node.
pub const HANDLE_LEFT: &str = "left";
/// Second array port of a zip node.
pub const HANDLE_RIGHT: &str = "right";

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow definition: typed nodes connected by directed edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Identifier of the workflow (stable across runs).
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The operation nodes. Order is only used for deterministic tie-breaking.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Directed edges between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Create an empty workflow with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Builder-style helper that appends a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder-style helper that appends an edge.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A single operation in the graph.
///
/// Serialized as `{ "id": ..., "type": ..., "data": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the workflow.
    pub id: String,
    /// Type tag plus type-specific configuration.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Marks the node as a sink whose value contributes to the run output.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sink: bool,
}

impl Node {
    /// Create a node with the given id and kind.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            sink: false,
        }
    }

    /// Mark the node as an explicit sink.
    pub fn as_sink(mut self) -> Self {
        self.sink = true;
        self
    }

    /// The node's type tag (e.g. `"condition"`).
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// A directed edge, optionally leaving or entering a named handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub source: String,
    /// Output port on the source node (`"true"`, `"body"`, a switch path, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Target node id.
    pub target: String,
    /// Input port on the target node (e.g. zip's `"left"` / `"right"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    /// Plain edge without handles.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
        }
    }

    /// Edge leaving the given source handle.
    pub fn from_handle(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_handle: Some(handle.into()),
            target: target.into(),
            target_handle: None,
        }
    }

    /// Set the target handle.
    pub fn into_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }
}
