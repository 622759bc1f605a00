//! Hierarchical subject patterns.
//!
//! Subjects are `.`-delimited token sequences. In a pattern `*` matches
//! exactly one token and `>` (final token only) matches one or more
//! trailing tokens. Everything else is compared literally.

pub const TOKEN_SEPARATOR: char = '.';
pub const SINGLE_WILDCARD: &str = "*";
pub const TAIL_WILDCARD: &str = ">";

/// A pattern is valid when every token is non-empty and `>` only appears last.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens = pattern.split(TOKEN_SEPARATOR).collect::<Vec<_>>();
    let last = tokens.len() - 1;
    tokens
        .iter()
        .enumerate()
        .all(|(idx, token)| !token.is_empty() && (*token != TAIL_WILDCARD || idx == last))
}

fn has_valid_tokens(subject: &str) -> bool {
    !subject.is_empty() && subject.split(TOKEN_SEPARATOR).all(|token| !token.is_empty())
}

/// Matches a concrete subject against a pattern. Subject tokens are taken
/// literally, so a subject containing `*` only matches a `*` or wildcard
/// position in the pattern.
pub fn subject_match(pattern: &str, subject: &str) -> bool {
    if !is_valid_pattern(pattern) || !has_valid_tokens(subject) {
        return false;
    }
    let pattern_tokens = pattern.split(TOKEN_SEPARATOR).collect::<Vec<_>>();
    let subject_tokens = subject.split(TOKEN_SEPARATOR).collect::<Vec<_>>();

    for (idx, token) in pattern_tokens.iter().enumerate() {
        if *token == TAIL_WILDCARD {
            return subject_tokens.len() > idx;
        }
        let Some(candidate) = subject_tokens.get(idx) else {
            return false;
        };
        if *token != SINGLE_WILDCARD && token != candidate {
            return false;
        }
    }
    pattern_tokens.len() == subject_tokens.len()
}

pub fn matches_any<S: AsRef<str>>(patterns: &[S], subject: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| subject_match(pattern.as_ref(), subject))
}

/// Returns true when every subject matched by `requested` is also matched by
/// `allowed`.
pub fn pattern_covers(allowed: &str, requested: &str) -> bool {
    if !is_valid_pattern(allowed) || !is_valid_pattern(requested) {
        return false;
    }
    let allowed_tokens = allowed.split(TOKEN_SEPARATOR).collect::<Vec<_>>();
    let requested_tokens = requested.split(TOKEN_SEPARATOR).collect::<Vec<_>>();

    for (idx, token) in allowed_tokens.iter().enumerate() {
        if *token == TAIL_WILDCARD {
            return requested_tokens.len() > idx;
        }
        let Some(wanted) = requested_tokens.get(idx) else {
            return false;
        };
        match (*token, *wanted) {
            (SINGLE_WILDCARD, TAIL_WILDCARD) => return false,
            (SINGLE_WILDCARD, _) => {}
            (_, SINGLE_WILDCARD) | (_, TAIL_WILDCARD) => return false,
            (literal, wanted) if literal != wanted => return false,
            _ => {}
        }
    }
    allowed_tokens.len() == requested_tokens.len()
}

pub fn covered_by_any<S: AsRef<str>>(allowed: &[S], requested: &str) -> bool {
    allowed
        .iter()
        .any(|pattern| pattern_covers(pattern.as_ref(), requested))
}
