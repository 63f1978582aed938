//! Parley configuration.
//!
//! TOML-based configuration for chat sessions. Every section uses serde
//! defaults so a partial `parley.toml` (or none at all) works out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use parley_config::{load_config, config_to_json};
//!
//! let config = load_config().expect("failed to load config");
//! println!("{}", config_to_json(&config));
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    Credentials, DeferredResubmit, LogLevel, LoggingConfig, ParleyConfig, RequestConfig,
    SessionConfig, StreamMode, CONFIG_SCHEMA_VERSION,
};

use parley_common::ConfigError;

/// Load config from the platform default path and validate it.
pub fn load_config() -> Result<ParleyConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &ParleyConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
