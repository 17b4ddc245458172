//! Validation for user-supplied path components (column names, partition
//! directory names): rejects anything that could escape the intended
//! directory or collide with reserved names, without touching the
//! filesystem itself.

use crate::error::Error;

const MAX_COMPONENT_LEN: usize = 1024;

/// Validate a single path component (not a full path): must be non-empty,
/// within the length cap, free of path separators and NUL, not starting
/// with `.`, and not containing `..` as a substring.
pub fn validate_component(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Range("path component must not be empty"));
    }
    if name.len() > MAX_COMPONENT_LEN {
        return Err(Error::Range("path component exceeds the length cap"));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(Error::Range("path component must not contain a separator or NUL"));
    }
    if name.starts_with('.') {
        return Err(Error::Range("path component must not start with '.'"));
    }
    if name.contains("..") {
        return Err(Error::Range("path component must not contain '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_name_is_valid() {
        assert!(validate_component("trade_px").is_ok());
    }

    #[test]
    fn rejects_empty_and_overlong() {
        assert!(validate_component("").is_err());
        assert!(validate_component(&"x".repeat(MAX_COMPONENT_LEN + 1)).is_err());
    }

    #[test]
    fn rejects_separators_and_traversal() {
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("a\\b").is_err());
        assert!(validate_component("..").is_err());
        assert!(validate_component("../etc").is_err());
        assert!(validate_component(".hidden").is_err());
    }
}
