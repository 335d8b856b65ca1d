//! Engine configuration loader.
//!
//! Reads a `weft.toml` file and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing or malformed.

use std::path::Path;

use weft_types::config::EngineConfig;

/// File name looked up when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "weft.toml";

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Parse `weft.toml` content.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, toml::de::Error> {
    let config: EngineConfig = toml::from_str(content)?;
    if config.loop_ceiling() != config.max_loop_iterations {
        tracing::warn!(
            configured = config.max_loop_iterations,
            enforced = config.loop_ceiling(),
            "max_loop_iterations outside the supported range"
        );
    }
    Ok(config)
}
