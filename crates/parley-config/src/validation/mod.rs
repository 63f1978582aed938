//! Full configuration validation.
//!
//! Each section has its own validator; this orchestrator calls them all and
//! collects every problem into a single `ConfigError`.

mod helpers;
mod request;
mod session;


use crate::schema::ParleyConfig;
use parley_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &ParleyConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    session::validate_session(&mut errors, config);
    request::validate_request(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
