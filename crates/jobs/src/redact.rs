//! Redaction of handler error messages before they are persisted.
//!
//! Stored errors end up in operator tooling and logs, so they must not carry
//! e-mail addresses or control characters, and they are bounded in length.

/// Maximum number of characters kept from an error message.
pub const MAX_ERROR_CHARS: usize = 512;

const MASK: &str = "[redacted]";
const ELLIPSIS: &str = "...";

/// Redact a handler error message for storage.
///
/// - control characters (including newlines) become spaces
/// - any whitespace-separated token containing `@` is replaced by `[redacted]`
/// - the result is truncated to [`MAX_ERROR_CHARS`] characters plus `...`
pub fn redact_error(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    let masked = cleaned
        .split(' ')
        .map(|token| if token.contains('@') { MASK } else { token })
        .collect::<Vec<_>>()
        .join(" ");

    truncate_chars(masked, MAX_ERROR_CHARS)
}

fn truncate_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
        s.push_str(ELLIPSIS);
    }
    s
}
