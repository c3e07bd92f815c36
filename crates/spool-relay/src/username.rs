//! Remote directory encoding of user names
//!
//! User names become part of a remote path, so they are mapped to their
//! IDNA ASCII form. The mapping is case-folding and reversible, which lets
//! the relay recover user names from the remote directory listing.

use crate::error::{RelayError, Result};

/// ASCII directory label for `name`.
pub fn encode_user(name: &str) -> Result<String> {
    let lowered = name.to_lowercase();
    let encoded = idna::domain_to_ascii(&lowered)
        .map_err(|e| RelayError::InvalidUser(format!("{:?}: {}", name, e)))?;
    validate_label(name, &encoded)?;
    Ok(encoded)
}

/// User name for a label produced by [`encode_user`].
pub fn decode_user(label: &str) -> Result<String> {
    let (decoded, result) = idna::domain_to_unicode(label);
    result.map_err(|e| RelayError::InvalidUser(format!("{:?}: {}", label, e)))?;
    validate_label(label, &decoded)?;
    Ok(decoded)
}

fn validate_label(input: &str, output: &str) -> Result<()> {
    if output.is_empty() || output == "." || output == ".." {
        return Err(RelayError::InvalidUser(format!("{:?}: empty", input)));
    }
    if output.contains(['/', '\\']) || output.chars().any(char::is_control) {
        return Err(RelayError::InvalidUser(format!(
            "{:?}: not a path component",
            input
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_names_are_lowercased() {
        assert_eq!(encode_user("Alice").unwrap(), "alice");
        assert_eq!(encode_user("bob-99").unwrap(), "bob-99");
    }

    #[test]
    fn test_unicode_names_round_trip() {
        let encoded = encode_user("Jürgen").unwrap();
        assert!(encoded.starts_with("xn--"));
        assert!(encoded.is_ascii());
        assert_eq!(decode_user(&encoded).unwrap(), "jürgen");
    }

    #[test]
    fn test_decode_plain_label() {
        assert_eq!(decode_user("carol").unwrap(), "carol");
    }

    #[test]
    fn test_unusable_names_are_rejected() {
        assert!(encode_user("").is_err());
        assert!(encode_user("a/b").is_err());
        assert!(matches!(
            encode_user("..").unwrap_err(),
            RelayError::InvalidUser(_)
        ));
    }
}
