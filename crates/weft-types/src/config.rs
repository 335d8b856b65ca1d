//! Engine configuration.
//!
//! `EngineConfig` is the top-level `weft.toml`. Every field has a default so
//! an empty file (or no file) yields a working engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Hard upper bound for loop iterations, regardless of configuration.
pub const ABSOLUTE_MAX_LOOP_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing leaf nodes across all runs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Engine ceiling for ForEach/WhileLoop iterations. Node-level values
    /// above this are clamped.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Deadline applied to each leaf node invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_node_timeout_ms: Option<u64>,

    /// Deadline for a whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,

    /// How sink values combine into the run output.
    #[serde(default)]
    pub sink_aggregation: SinkAggregation,

    #[serde(default)]
    pub http: HttpSettings,
}

fn default_max_workers() -> usize {
    16
}

fn default_max_loop_iterations() -> u32 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_loop_iterations: default_max_loop_iterations(),
            default_node_timeout_ms: None,
            run_timeout_ms: None,
            sink_aggregation: SinkAggregation::default(),
            http: HttpSettings::default(),
        }
    }
}

impl EngineConfig {
    /// The loop ceiling actually enforced.
    pub fn loop_ceiling(&self) -> u32 {
        self.max_loop_iterations.clamp(1, ABSOLUTE_MAX_LOOP_ITERATIONS)
    }
}

/// Policy for turning sink values into the run output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkAggregation {
    /// Value of the first completed sink in plan order.
    First,
    /// Value of one named sink.
    Named(String),
    /// Map of sink id to value.
    #[default]
    All,
}

/// Settings for the HTTP client subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Named clients addressable from an http node's `client` field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub clients: BTreeMap<String, HttpClientSettings>,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    concat!("weft/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_http_timeout_ms(),
            user_agent: default_user_agent(),
            clients: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpClientSettings {
    /// Prefixed to relative request URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.sink_aggregation, SinkAggregation::All);
        assert!(config.run_timeout_ms.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_workers = 4
max_loop_iterations = 50
run_timeout_ms = 60000
sink_aggregation = { named = "result" }

[http]
timeout_ms = 5000

[http.clients.github]
base_url = "https://api.github.com"
headers = { accept = "application/vnd.github+json" }
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.loop_ceiling(), 50);
        assert_eq!(config.run_timeout_ms, Some(60_000));
        assert_eq!(
            config.sink_aggregation,
            SinkAggregation::Named("result".to_string())
        );
        assert_eq!(config.http.timeout_ms, 5000);
        let github = &config.http.clients["github"];
        assert_eq!(github.base_url.as_deref(), Some("https://api.github.com"));
        assert_eq!(github.headers["accept"], "application/vnd.github+json");
    }

    #[test]
    fn test_sink_aggregation_unit_variant_from_string() {
        let config: EngineConfig = toml::from_str(r#"sink_aggregation = "first""#).unwrap();
        assert_eq!(config.sink_aggregation, SinkAggregation::First);
    }

    #[test]
    fn test_loop_ceiling_is_bounded() {
        let config = EngineConfig {
            max_loop_iterations: u32::MAX,
            ..Default::default()
        };
        assert_eq!(config.loop_ceiling(), ABSOLUTE_MAX_LOOP_ITERATIONS);
    }
}
