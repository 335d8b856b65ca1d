//! Node kinds and their type-specific configuration.
//!
//! `NodeKind` is a closed tagged union. Each variant wraps a config struct so
//! that behaviors can be written against a concrete type, and the scheduler
//! dispatches on the tag rather than on trait objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// The type tag of a node plus its configuration.
///
/// Adjacently tagged so a node reads as:
/// ```yaml
/// id: check-age
/// type: condition
/// data:
///   expression: "input >= 18"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
    // Leaves
    Input(InputConfig),
    Constant(ConstantConfig),
    Output(OutputConfig),

    // Arithmetic / text
    Math(MathConfig),
    Text(TextConfig),

    // Control flow
    Condition(ConditionConfig),
    Switch(SwitchConfig),
    ForEach(ForEachConfig),
    WhileLoop(WhileLoopConfig),
    Parallel(ParallelConfig),
    Join(JoinConfig),
    Split(SplitConfig),
    Partition(ArrayExprConfig),

    // Array transforms
    Filter(ArrayExprConfig),
    Map(ArrayExprConfig),
    Reduce(ReduceConfig),
    FlatMap(ArrayExprConfig),
    Find(ArrayExprConfig),
    Sort(SortConfig),
    Slice(SliceConfig),
    Chunk(ChunkConfig),
    Sample(SampleConfig),
    Range(RangeConfig),
    Zip(ArraySourceConfig),
    Unique(UniqueConfig),
    GroupBy(GroupByConfig),
    Compact(ArraySourceConfig),
    Reverse(ArraySourceConfig),
    Transpose(ArraySourceConfig),

    // State
    Variable(VariableConfig),
    Counter(CounterConfig),
    Accumulator(AccumulatorConfig),
    Cache(CacheConfig),

    // Resilience
    Retry(RetryConfig),
    TryCatch(TryCatchConfig),
    Timeout(TimeoutConfig),
    Delay(DelayConfig),

    // Network
    Http(HttpConfig),
}

impl NodeKind {
    /// The serialized type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Constant(_) => "constant",
            Self::Output(_) => "output",
            Self::Math(_) => "math",
            Self::Text(_) => "text",
            Self::Condition(_) => "condition",
            Self::Switch(_) => "switch",
            Self::ForEach(_) => "for_each",
            Self::WhileLoop(_) => "while_loop",
            Self::Parallel(_) => "parallel",
            Self::Join(_) => "join",
            Self::Split(_) => "split",
            Self::Partition(_) => "partition",
            Self::Filter(_) => "filter",
            Self::Map(_) => "map",
            Self::Reduce(_) => "reduce",
            Self::FlatMap(_) => "flat_map",
            Self::Find(_) => "find",
            Self::Sort(_) => "sort",
            Self::Slice(_) => "slice",
            Self::Chunk(_) => "chunk",
            Self::Sample(_) => "sample",
            Self::Range(_) => "range",
            Self::Zip(_) => "zip",
            Self::Unique(_) => "unique",
            Self::GroupBy(_) => "group_by",
            Self::Compact(_) => "compact",
            Self::Reverse(_) => "reverse",
            Self::Transpose(_) => "transpose",
            Self::Variable(_) => "variable",
            Self::Counter(_) => "counter",
            Self::Accumulator(_) => "accumulator",
            Self::Cache(_) => "cache",
            Self::Retry(_) => "retry",
            Self::TryCatch(_) => "try_catch",
            Self::Timeout(_) => "timeout",
            Self::Delay(_) => "delay",
            Self::Http(_) => "http",
        }
    }

    /// Nodes whose result prunes outgoing edges that carry no handle.
    ///
    /// For these kinds an unlabeled outgoing edge is only live if the node
    /// leaves `selected_handles` unset.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition(_) | Self::Switch(_))
    }

    /// Nodes that own a body subgraph and run it themselves.
    pub fn is_scoped(&self) -> bool {
        matches!(
            self,
            Self::ForEach(_)
                | Self::WhileLoop(_)
                | Self::Retry(_)
                | Self::TryCatch(_)
                | Self::Timeout(_)
        )
    }

    /// Loop nodes whose body runs once per iteration.
    pub fn is_loop(&self) -> bool {
        matches!(self, Self::ForEach(_) | Self::WhileLoop(_))
    }
}

// ---------------------------------------------------------------------------
// Leaves
// ---------------------------------------------------------------------------

/// Reads the run input (or one field of it).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Dotted path into the run input. `None` passes the whole input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Value used when the field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantConfig {
    pub value: serde_json::Value,
}

/// Marks a terminal value. Always treated as a sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Optional expression computing the sink value (default: input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

// ---------------------------------------------------------------------------
// Arithmetic / text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Min,
    Max,
    Abs,
    Negate,
    Round,
    Floor,
    Ceil,
    Sqrt,
}

impl MathOperation {
    /// Binary operations take their right-hand side from `operand`.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Subtract
                | Self::Multiply
                | Self::Divide
                | Self::Modulo
                | Self::Power
                | Self::Min
                | Self::Max
        )
    }
}

/// Applies an arithmetic operation to a numeric input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathConfig {
    pub operation: MathOperation,
    /// Right-hand side for binary operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<serde_json::Number>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperation {
    Uppercase,
    Lowercase,
    Trim,
    Length,
    Concat,
    Split,
    Join,
    Replace,
    Template,
}

/// Applies a string operation to the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
    pub operation: TextOperation,
    /// Separator for `split`, `join` and `concat`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// Substring replaced by `replace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Text with `{{ expression }}` placeholders for `template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

/// Evaluates a boolean expression and selects the `true` or `false` handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub expression: String,
}

/// A multi-way branch. Cases are tried in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Expression selecting the switched value (default: input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub cases: Vec<SwitchCase>,
}

/// One switch case: either an exact `value`, a `when` expression, or the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Matched with typed JSON equality; `"200"` never matches `200`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Handle selected on match. Defaults to `"default"` for the default case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl SwitchCase {
    /// The handle this case selects.
    pub fn path(&self) -> &str {
        match &self.output_path {
            Some(p) => p,
            None if self.is_default => crate::workflow::HANDLE_DEFAULT,
            None => "",
        }
    }
}

/// Runs its body once per element of an array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachConfig {
    /// Expression selecting the items (default: input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Runs its body while `condition` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhileLoopConfig {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Permits shared by every node in the parallel scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Wait for every live branch; any failure fails the join.
    #[default]
    All,
    /// First successful branch wins.
    Any,
    /// First branch to finish wins, success or not.
    First,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(default)]
    pub strategy: JoinStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub paths: Vec<String>,
}

// ---------------------------------------------------------------------------
// Array transforms
// ---------------------------------------------------------------------------

/// Shared config for transforms driven by one per-element expression
/// (filter, map, flat_map, find, partition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayExprConfig {
    pub expression: String,
    /// Expression selecting the array (default: input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Config for fixed transforms that only need the array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArraySourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceConfig {
    /// Combines `acc` and `item` into the next accumulator.
    pub expression: String,
    #[serde(default)]
    pub initial_value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortConfig {
    /// Per-element expression giving the sort key (default: the element).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Negative indices count from the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceConfig {
    #[serde(default)]
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    pub count: usize,
    /// Fixed seed for reproducible samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Half-open integer range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default)]
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_range_step")]
    pub step: i64,
}

fn default_range_step() -> i64 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniqueConfig {
    /// Per-element expression used for identity (default: the element).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByConfig {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableOperation {
    Get,
    Set,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Process-wide; outlives the run.
    Global,
    /// Shared by every node of this run.
    #[default]
    Workflow,
    /// Private to this node within the run.
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableConfig {
    pub operation: VariableOperation,
    pub name: String,
    #[serde(default)]
    pub scope: VariableScope,
    /// Literal value written by `set` (takes precedence over `expression`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Expression whose result `set` writes. Without either, `set` writes the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Value returned by `get` when the slot is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterOperation {
    Increment,
    Decrement,
    Reset,
    Get,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    /// Keyed by node id within the run.
    #[default]
    Run,
    /// Stored in the global variable store.
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    pub operation: CounterOperation,
    #[serde(default = "default_counter_delta")]
    pub delta: i64,
    #[serde(default)]
    pub initial_value: i64,
    #[serde(default)]
    pub scope: CounterScope,
    /// Shared counter name. Defaults to the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_counter_delta() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorOperation {
    Sum,
    Product,
    Concat,
    Array,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    pub operation: AccumulatorOperation,
    /// Seed value. Defaults to the operation's identity (0, 1, "", [], 0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    Get,
    Set,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least recently used entry.
    #[default]
    Lru,
    /// Evict the least frequently used entry.
    Lfu,
    /// Evict the entry closest to expiry.
    Ttl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub operation: CacheOperation,
    /// Expression producing the cache key; non-string results are JSON-encoded.
    pub key: String,
    /// Expression producing the value for `set` (default: input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Re-runs the body on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Only retry these kinds. Empty means every retryable kind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_on_errors: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            retry_on_errors: Vec::new(),
        }
    }
}

/// Runs the body and converts failures into a fallback result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryCatchConfig {
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<serde_json::Value>,
    /// Handle selected when an error is caught (default `"error"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output_path: Option<String>,
    /// Also catch resource and cancellation errors.
    #[serde(default)]
    pub catch_resource_errors: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TryCatchConfig {
    fn default() -> Self {
        Self {
            continue_on_error: true,
            fallback_value: None,
            error_output_path: None,
            catch_resource_errors: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Error,
    ContinueWithPartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub timeout_ms: u64,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Calls out through a named HTTP client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Named client from the registry (default client when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    /// URL with `{{ expression }}` placeholders.
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON body. String leaves are rendered as templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Treat non-2xx responses as `http` errors.
    #[serde(default = "default_true")]
    pub fail_on_status: bool,
}

fn default_method() -> String {
    "GET".to_string()
}
