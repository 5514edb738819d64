//! Markdown to plain speakable text.

use std::sync::LazyLock;

use regex::Regex;

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?(```|$)").unwrap());
static TABLE_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\|.*$").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*#{1,6}[ \t]+").unwrap());
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+[.)])[ \t]+").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]*)`").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__").unwrap());
static ITALIC_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
// Underscore emphasis only at word boundaries so snake_case survives.
static ITALIC_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\w])_([^_\n]+)_([^\w]|$)").unwrap());
static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+").unwrap());
static DOUBLED_STOP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([.!?:;])\s*\.\s").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip Markdown syntax, keeping the words a listener cares about.
///
/// Code blocks and table rows are dropped entirely, links keep their label,
/// and paragraph breaks become sentence breaks.
pub fn strip_markdown(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = FENCED_CODE.replace_all(&text, "");
    let text = TABLE_ROW.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = LIST_MARKER.replace_all(&text, "");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = BOLD.replace_all(&text, "$1$2");
    let text = ITALIC_STAR.replace_all(&text, "$1");
    let text = ITALIC_UNDERSCORE.replace_all(&text, "$1$2$3");

    let text = PARAGRAPH_BREAK.replace_all(text.trim(), ". ");
    let text = DOUBLED_STOP.replace_all(&text, "$1 ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_emphasis() {
        assert_eq!(strip_markdown("use **bold** here"), "use bold here");
        assert_eq!(strip_markdown("an *italic* and __strong__ word"), "an italic and strong word");
        assert_eq!(strip_markdown("keep snake_case_names and _this_"), "keep snake_case_names and this");
    }

    #[test]
    fn links_keep_label_and_code_keeps_text() {
        assert_eq!(
            strip_markdown("see [the docs](https://example.com) and run `cargo test`"),
            "see the docs and run cargo test"
        );
    }

    #[test]
    fn drops_code_blocks_and_tables() {
        let text = "Before\n```rust\nfn main() {}\n```\nAfter\n| a | b |\n|---|---|\n| 1 | 2 |";
        assert_eq!(strip_markdown(text), "Before. After");
    }

    #[test]
    fn headings_and_lists_become_sentences() {
        let text = "## Status\n\n- first item\n- second item\n\n1. numbered";
        assert_eq!(strip_markdown(text), "Status. first item second item. numbered");
    }

    #[test]
    fn paragraph_after_full_stop_is_not_doubled() {
        assert_eq!(strip_markdown("Done.\n\n\nNext step"), "Done. Next step");
    }

    #[test]
    fn only_markup_leaves_nothing() {
        assert_eq!(strip_markdown("```\ncode only\n```"), "");
    }
}
