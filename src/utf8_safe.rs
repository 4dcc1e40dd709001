//! UTF-8 safe truncation for log previews and user-facing snippets.
//!
//! User input arrives as arbitrary UTF-8, so byte slicing could panic in the
//! middle of a multi-byte character.

/// Returns a prefix of the string up to `max_chars` characters.
pub fn safe_prefix(s: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncates to `max_chars` characters, marking the cut with `...`.
pub fn ellipsize(s: &str, max_chars: usize) -> String {
    let prefix = safe_prefix(s, max_chars);
    if prefix.len() == s.len() {
        return s.to_string();
    }
    format!("{prefix}...")
}
