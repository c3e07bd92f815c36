//! Human readable byte sizes such as `8GiB`, `500 MB` or `4096`

use crate::error::{CacheError, Result};

/// Parse a byte count.
///
/// Accepts digits, an optional space, an optional magnitude letter
/// (`k`, `m`, `g`, `t` in any case) that selects powers of 1000, or powers
/// of 1024 when followed by `i`, and an optional trailing `b`/`B`.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(invalid(input, "expected a number"));
    }
    let value: u64 = s[..digits_end]
        .parse()
        .map_err(|_| invalid(input, "number too large"))?;

    let rest = &s[digits_end..];
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    let mut chars = rest.chars().peekable();

    let exponent = match chars.peek().map(|c| c.to_ascii_lowercase()) {
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        _ => 0,
    };
    let mut base: u64 = 1000;
    if exponent > 0 {
        chars.next();
        if matches!(chars.peek(), Some('i') | Some('I')) {
            chars.next();
            base = 1024;
        }
    }
    if matches!(chars.peek(), Some('b') | Some('B')) {
        chars.next();
    }
    if chars.next().is_some() {
        return Err(invalid(input, "unexpected unit"));
    }

    base.checked_pow(exponent)
        .and_then(|multiplier| value.checked_mul(multiplier))
        .ok_or_else(|| invalid(input, "size too large"))
}

fn invalid(input: &str, reason: &str) -> CacheError {
    CacheError::InvalidSize(format!("'{}': {}", input, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("12b").unwrap(), 12);
        assert_eq!(parse_size("12 B").unwrap(), 12);
    }

    #[test]
    fn test_decimal_units() {
        assert_eq!(parse_size("10k").unwrap(), 10_000);
        assert_eq!(parse_size("5 MB").unwrap(), 5_000_000);
        assert_eq!(parse_size("2g").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("1T").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn test_binary_units() {
        assert_eq!(parse_size("10Ki").unwrap(), 10 * 1024);
        assert_eq!(parse_size("12 MiB").unwrap(), 12 * 1024 * 1024);
        assert_eq!(parse_size("8GiB").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1tib").unwrap(), 1024u64.pow(4));
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        assert_eq!(parse_size("  3 k ").unwrap(), 3000);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("1.5G").is_err());
        assert!(parse_size("12  MB").is_err());
        assert!(parse_size("12ib").is_err());
    }

    #[test]
    fn test_rejects_overflow() {
        assert!(parse_size("99999999999999999999").is_err());
        assert!(parse_size("20000000TiB").is_err());
    }
}
