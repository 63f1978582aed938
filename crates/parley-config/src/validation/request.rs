use std::sync::LazyLock;

use regex::Regex;

use crate::schema::ParleyConfig;

/// RFC 9110 token characters.
static HEADER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9!#$%&'*+.^_`|~-]+$").unwrap());

pub(crate) fn validate_request(errors: &mut Vec<String>, config: &ParleyConfig) {
    for (name, value) in &config.request.headers {
        if !HEADER_NAME_RE.is_match(name) {
            errors.push(format!("request.headers: invalid header name {name:?}"));
        }
        if value.contains('\n') || value.contains('\r') {
            errors.push(format!(
                "request.headers.{name}: value must not contain line breaks"
            ));
        }
    }
}
