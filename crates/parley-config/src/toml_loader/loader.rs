//! Reading `parley.toml` into a [`ParleyConfig`].

use crate::schema::ParleyConfig;
use crate::validation;
use parley_common::ConfigError;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

use super::paths::{create_default_config, default_config_path};

/// Read a session config from `path`.
///
/// Absent tables and keys take their schema defaults, so an empty file is a
/// valid config for a local `http://localhost:3000/api/chat` server. Range problems
/// such as `max_steps = 0` are only logged; the CLI runs
/// [`validation::validate`] itself before opening a session.
pub fn load_from_path(path: &Path) -> Result<ParleyConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(ConfigError::ParseError(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let config: ParleyConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

    if let Err(e) = validation::validate(&config) {
        warn!(path = %path.display(), "config validation warning: {e}");
    }

    info!(path = %path.display(), api = %config.session.api, "loaded session config");
    Ok(config)
}

/// Read `path`, writing the commented template there first if nothing exists.
/// A fresh template yields the default config.
pub fn load_or_create(path: &Path) -> Result<ParleyConfig, ConfigError> {
    match load_from_path(path) {
        Err(ConfigError::FileNotFound(_)) => {
            info!(path = %path.display(), "no parley.toml yet, writing the template");
            create_default_config(path)?;
            Ok(ParleyConfig::default())
        }
        other => other,
    }
}

/// [`load_or_create`] at [`default_config_path`].
pub fn load_default() -> Result<ParleyConfig, ConfigError> {
    load_or_create(&default_config_path()?)
}
