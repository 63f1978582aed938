use crate::schema::ParleyConfig;

use super::helpers::validate_range;

pub(crate) fn validate_session(errors: &mut Vec<String>, config: &ParleyConfig) {
    let session = &config.session;

    validate_range(errors, "session.max_steps", session.max_steps, 1, 100);

    let api = session.api.trim();
    if api.is_empty() {
        errors.push("session.api must not be empty".into());
    } else if !(api.starts_with("http://") || api.starts_with("https://")) {
        errors.push(format!("session.api = {api:?} must be an http(s) URL"));
    }

    if let Some(id) = &session.id {
        if id.trim().is_empty() {
            errors.push("session.id must not be blank when set".into());
        }
    }
}
