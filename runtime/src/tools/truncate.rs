//! Output truncation.
//!
//! Tool output is capped before it is stored or displayed, and again (with
//! a much larger budget) before it is sent to a summarization LLM. Token
//! counts are estimated at four bytes per token; the cut is backed up to a
//! UTF-8 boundary and then to the previous line break so the surviving
//! text stays readable.

/// Byte cap applied to every tool result before storage or display.
pub const STORAGE_MAX_BYTES: usize = 8000 * 4;

/// Byte cap applied before sending content to a summarization LLM.
pub const SUMMARIZATION_MAX_BYTES: usize = 100_000 * 4;

/// Rough token estimate: four bytes per token, rounded up.
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4)
}

/// Truncate for the storage/display budget.
pub fn truncate_for_storage(content: &str) -> String {
    truncate_with_marker(content, STORAGE_MAX_BYTES, "tool output truncated")
}

/// Truncate for the summarization budget.
pub fn truncate_for_summarization(content: &str) -> String {
    truncate_with_marker(content, SUMMARIZATION_MAX_BYTES, "summarization input truncated")
}

/// Truncate `content` to at most `max_bytes`, appending a marker that names
/// the original and limit sizes. Returns the input unchanged when it fits.
pub fn truncate_with_marker(content: &str, max_bytes: usize, marker: &str) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }

    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut head = &content[..cut];
    if let Some(pos) = head.rfind('\n') {
        head = &head[..pos];
    }

    format!(
        "{}\n\n[TRUNCATED: {} - Original size: {}, limit: {}]",
        head,
        marker,
        format_size(content.len()),
        format_size(max_bytes)
    )
}

/// Render a byte count as bytes below 1 KiB and whole KiB otherwise.
fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else {
        format!("{} KiB", bytes / 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_unchanged() {
        assert_eq!(truncate_with_marker("hello", 100, "m"), "hello");
        assert_eq!(truncate_with_marker("", 0, "m"), "");
    }

    #[test]
    fn long_content_gets_marker() {
        let content = "x".repeat(100);
        let result = truncate_with_marker(&content, 10, "m");
        assert!(result.starts_with("xxxxxxxxxx"));
        assert!(result.contains("[TRUNCATED: m - Original size: 100 B, limit: 10 B]"));
    }

    #[test]
    fn cut_backs_up_to_line_boundary() {
        let content = format!("line one\nline two\n{}", "y".repeat(50));
        let result = truncate_with_marker(&content, 15, "m");
        // The cut lands inside "line two"; output keeps only complete lines.
        assert!(result.starts_with("line one\n\n[TRUNCATED"));
    }

    #[test]
    fn cut_respects_utf8_boundaries() {
        // Each snowman is three bytes; a cap of 7 bytes lands mid-character.
        let content = "\u{2603}\u{2603}\u{2603}\u{2603}";
        let result = truncate_with_marker(content, 7, "m");
        assert!(result.starts_with("\u{2603}\u{2603}"));
        assert!(std::str::from_utf8(result.as_bytes()).is_ok());
    }

    #[test]
    fn sizes_render_in_kib_above_threshold() {
        let content = "z".repeat(4096);
        let result = truncate_with_marker(&content, 2048, "m");
        assert!(result.contains("Original size: 4 KiB, limit: 2 KiB"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn storage_budget_is_applied() {
        let content = "a".repeat(STORAGE_MAX_BYTES + 1);
        let result = truncate_for_storage(&content);
        assert!(result.len() < content.len());
        assert!(result.contains("[TRUNCATED:"));

        let small = "a".repeat(STORAGE_MAX_BYTES);
        assert_eq!(truncate_for_storage(&small), small);
    }
}
