use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static WORKSPACE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").unwrap());
static NOT_TAG_SAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9-._]").unwrap());

/// Generate a fresh workspace id: 128 bits from the thread-local CSPRNG,
/// rendered as 32 lowercase hex digits.
pub fn random_workspace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Whether `s` looks like something [`random_workspace_id`] produced.
pub fn is_workspace_id(s: &str) -> bool {
    WORKSPACE_ID.is_match(s)
}

/// Transform a random string as a valid docker name component (only
/// containing alpha/num, dots, underscores & dashes).
///
/// This function replaces invalid characters into double underlines `__`.
pub(crate) fn transform_string_as_docker_name(s: &str) -> Cow<str> {
    NOT_TAG_SAFE.replace_all(s, "__")
}
