use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns the first `n` characters, with a trailing ellipsis when truncated.
pub fn first_n_chars_lossy(s: &str, n: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, n);
    if prefix.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", prefix))
    }
}
