/// Telegram caption limit, in characters.
pub const CAPTION_LIMIT: usize = 1024;
/// Telegram text message limit, in characters.
pub const MESSAGE_LIMIT: usize = 4096;

/// Turn literal `\n` and `\t` escape sequences left by editors or models into
/// real whitespace.
pub fn normalize_delivery_text(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\t", "\t")
}

/// Cut `text` to at most `limit` characters, never splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_become_whitespace() {
        assert_eq!(normalize_delivery_text("a\\nb\\tc"), "a\nb\tc");
        assert_eq!(normalize_delivery_text("plain"), "plain");
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("привет", 3), "при");
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("", 0), "");
    }
}
