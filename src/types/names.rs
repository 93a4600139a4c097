//! Syntax rules for names.

use thiserror::Error;

/// Longest permitted name, in characters.
pub const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is longer than {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("name contains the invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("name starts or ends with a hyphen")]
    EdgeHyphen,
    #[error("name is blacklisted")]
    Blacklisted,
}

/// Check that `name` is non-empty, at most [`MAX_NAME_LEN`] characters of `[a-z0-9-_]`, and neither
/// starts nor ends with a hyphen.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(NameError::InvalidCharacter(c));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(NameError::EdgeHyphen);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        assert_eq!(validate_name("foo"), Ok(()));
        assert_eq!(validate_name("a-b_c9"), Ok(()));
        assert_eq!(validate_name(&"x".repeat(MAX_NAME_LEN)), Ok(()));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert_eq!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)), Err(NameError::TooLong));
        assert_eq!(validate_name("Foo"), Err(NameError::InvalidCharacter('F')));
        assert_eq!(validate_name("foo.bar"), Err(NameError::InvalidCharacter('.')));
        assert_eq!(validate_name("-foo"), Err(NameError::EdgeHyphen));
        assert_eq!(validate_name("foo-"), Err(NameError::EdgeHyphen));
    }
}
