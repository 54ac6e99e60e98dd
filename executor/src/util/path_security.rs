//! Helper functions to keep user-supplied file names inside their workspace.
//!
//! A submitted filename is later joined onto a workspace directory and
//! substituted into a shell command, so it has to be a single plain path
//! component made only of characters that mean nothing to a shell.

use std::path::{Component, Path};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::err::ValidationError;

/// Longest filename accepted, in bytes. Matches the usual `NAME_MAX`.
pub const MAX_FILENAME_LEN: usize = 255;

static FILENAME_ALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").unwrap());

static CLASS_NAME_ALLOWED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Checks that `name` is exactly one normal path component and only uses
/// allow-listed characters. Returns `Err` if it's not.
pub fn enforce_single_component(name: &str) -> Result<(), ValidationError> {
    let unsafe_name = || ValidationError::UnsafeFilename(name.to_owned());

    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(unsafe_name());
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => {}
        _ => return Err(unsafe_name()),
    }

    if !FILENAME_ALLOWED.is_match(name) {
        return Err(unsafe_name());
    }
    Ok(())
}

/// Whether `name` may be used verbatim as a class name in a run command.
pub fn is_valid_class_name(name: &str) -> bool {
    CLASS_NAME_ALLOWED.is_match(name)
}
