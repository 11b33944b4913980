// SPDX-License-Identifier: MIT
//! Subject validation and NATS-style pattern matching (spec.md §3.1, §4.1).
//!
//! Subjects are dot-separated, ASCII-printable, non-empty segments, length
//! <= 256. Patterns additionally allow `*` (exactly one segment) and `>`
//! (one or more trailing segments, must be last).

const MAX_SUBJECT_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSubject {
    #[error("subject is empty")]
    Empty,
    #[error("subject exceeds {MAX_SUBJECT_LEN} characters")]
    TooLong,
    #[error("subject contains a control character")]
    ControlChar,
    #[error("subject contains a non-ASCII-printable character")]
    NonPrintable,
    #[error("subject segment is empty")]
    EmptySegment,
    #[error("subject contains a wildcard segment")]
    Wildcard,
}

/// Validate a *concrete* subject — the form required by `publish`,
/// `registerEndpoint`, and `signal`. Rejects empty, oversized, control-char,
/// or wildcard-containing subjects.
pub fn validate(s: &str) -> Result<(), InvalidSubject> {
    if s.is_empty() {
        return Err(InvalidSubject::Empty);
    }
    if s.len() > MAX_SUBJECT_LEN {
        return Err(InvalidSubject::TooLong);
    }
    for c in s.chars() {
        if c.is_control() {
            return Err(InvalidSubject::ControlChar);
        }
        if !c.is_ascii_graphic() && c != ' ' {
            return Err(InvalidSubject::NonPrintable);
        }
    }
    let mut any_segment = false;
    for seg in s.split('.') {
        any_segment = true;
        if seg.is_empty() {
            return Err(InvalidSubject::EmptySegment);
        }
        if seg == "*" || seg == ">" {
            return Err(InvalidSubject::Wildcard);
        }
    }
    if !any_segment {
        return Err(InvalidSubject::EmptySegment);
    }
    Ok(())
}

/// Validate a *pattern* — a subject that may contain `*` or `>` wildcard
/// segments, subject to the placement rules in spec.md §4.1.
pub fn validate_pattern(p: &str) -> Result<(), InvalidSubject> {
    if p.is_empty() {
        return Err(InvalidSubject::Empty);
    }
    if p.len() > MAX_SUBJECT_LEN {
        return Err(InvalidSubject::TooLong);
    }
    if p.starts_with('.') || p.ends_with('.') {
        return Err(InvalidSubject::EmptySegment);
    }
    for c in p.chars() {
        if c.is_control() {
            return Err(InvalidSubject::ControlChar);
        }
        if !c.is_ascii_graphic() && c != ' ' {
            return Err(InvalidSubject::NonPrintable);
        }
    }
    let segments: Vec<&str> = p.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return Err(InvalidSubject::EmptySegment);
        }
        if *seg == ">" && i != segments.len() - 1 {
            return Err(InvalidSubject::Wildcard);
        }
    }
    Ok(())
}

/// Match a (possibly wildcarded) pattern against a concrete subject.
///
/// - `a.b.c` matches pattern `a.b.c`.
/// - `*` matches exactly one segment.
/// - `>` matches one or more trailing segments and must consume at least one.
/// - A concrete pattern (no wildcards) matches only its own exact subject.
pub fn matches(pattern: &str, concrete: &str) -> bool {
    let p_segs: Vec<&str> = pattern.split('.').collect();
    let c_segs: Vec<&str> = concrete.split('.').collect();

    let mut pi = 0;
    let mut ci = 0;
    while pi < p_segs.len() {
        let p = p_segs[pi];
        if p == ">" {
            // Must be last segment of the pattern (enforced by validate_pattern,
            // but re-checked here defensively) and must consume >= 1 segment.
            return ci < c_segs.len();
        }
        if ci >= c_segs.len() {
            return false;
        }
        if p != "*" && p != c_segs[ci] {
            return false;
        }
        pi += 1;
        ci += 1;
    }
    ci == c_segs.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("a.b.c", "a.b.c"));
        assert!(!matches("a.b.c", "a.b.d"));
    }

    #[test]
    fn single_wildcard() {
        assert!(matches("a.*.c", "a.x.c"));
        assert!(!matches("a.*.c", "a.x.y.c"));
        assert!(!matches("a.*.c", "a.c"));
    }

    #[test]
    fn trailing_wildcard_needs_one_segment() {
        assert!(matches("a.>", "a.b"));
        assert!(matches("a.>", "a.b.c"));
        assert!(!matches("a.>", "a"));
    }

    #[test]
    fn adjacent_wildcards_legal() {
        assert!(matches("*.*", "a.b"));
        assert!(!matches("*.*", "a"));
        assert!(!matches("*.*", "a.b.c"));
    }

    #[test]
    fn concrete_subject_matches_only_itself() {
        for s in ["x", "x.y", "x.y.z"] {
            assert!(matches(s, s));
        }
        assert!(!matches("relay.agent.backend", "relay.agent.other"));
    }

    #[test]
    fn validate_rejects_wildcards_and_empties() {
        assert!(validate("a.b.c").is_ok());
        assert_eq!(validate(""), Err(InvalidSubject::Empty));
        assert_eq!(validate("a..b"), Err(InvalidSubject::EmptySegment));
        assert_eq!(validate("a.*.c"), Err(InvalidSubject::Wildcard));
        assert_eq!(validate("a.>"), Err(InvalidSubject::Wildcard));
        assert_eq!(validate("a\nb"), Err(InvalidSubject::ControlChar));
        assert_eq!(validate(&"a".repeat(300)), Err(InvalidSubject::TooLong));
    }

    #[test]
    fn validate_pattern_rejects_leading_trailing_dot() {
        assert!(validate_pattern("a.*.c").is_ok());
        assert!(validate_pattern(".a.b").is_err());
        assert!(validate_pattern("a.b.").is_err());
        assert!(validate_pattern("a.>.b").is_err());
    }

    proptest::proptest! {
        #[test]
        fn concrete_subject_always_matches_itself(
            segs in proptest::collection::vec("[a-z]{1,5}", 1..5)
        ) {
            let s = segs.join(".");
            proptest::prop_assert!(matches(&s, &s));
        }
    }
}
