//! Revision targets and their textual syntax (§6 "Revision syntax for tooling"), shared by
//! [`crate::database::Database::sync`] and the vacuum CLI's `--revision`-style arguments.

use std::fmt;

/// A revision to synchronise a [`crate::database::Database`] to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Revision {
    /// The most recent committed revision, as recorded by the leader's footer pointer.
    Head,
    /// A specific, already-committed generation number.
    Numbered(u64),
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Head => write!(f, "HEAD"),
            Revision::Numbered(n) => write!(f, "{n}"),
        }
    }
}

/// Parses a revision argument: a decimal unsigned integer, or the case-insensitive token
/// `HEAD`, with optional surrounding whitespace. Anything else — empty input, a sign, stray
/// non-digit characters, a `0x` prefix — is rejected (§8 scenario S8).
pub fn parse(input: &str) -> Option<Revision> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case("head") {
        return Some(Revision::Head);
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u64>().ok().map(Revision::Numbered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_head_case_insensitively_with_whitespace() {
        assert_eq!(parse("HEAD"), Some(Revision::Head));
        assert_eq!(parse(" head "), Some(Revision::Head));
        assert_eq!(parse("HeAd"), Some(Revision::Head));
    }

    #[test]
    fn accepts_a_padded_decimal_number() {
        assert_eq!(parse("  42  "), Some(Revision::Numbered(42)));
        assert_eq!(parse("0"), Some(Revision::Numbered(0)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("123Bad"), None);
        assert_eq!(parse("-1"), None);
        assert_eq!(parse("0x23"), None);
        assert_eq!(parse("+5"), None);
    }
}
