//! Post-processing: deterministic cleanup of LLM output.
//!
//! Two families of rules live here:
//!
//! * [`clean_page_text`] tidies repaired page text. Models occasionally wrap
//!   their answer in code fences, switch to `\r\n` line endings, or leave
//!   zero-width characters behind; none of that is content.
//! * [`extract_json`] digs the JSON object out of a structured answer that
//!   came back wrapped in fences or prose.
//!
//! Every rule is a pure `&str -> String` function so they can be tested and
//! reordered independently.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

/// Apply the page-text rules in order:
///
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF/CR → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 1
/// 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 6. Trim the whole text
pub fn clean_page_text(input: &str) -> String {
    let s = strip_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    s.trim().to_string()
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\r?\n(.*?)\r?\n```\s*$").unwrap()
});

fn strip_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 5: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Structured answers ───────────────────────────────────────────────────────

/// The outermost `{ ... }` object in `input`, after stripping code fences.
///
/// Returns `None` when no brace-balanced object exists. Braces inside JSON
/// strings are respected.
pub fn extract_json(input: &str) -> Option<String> {
    let s = strip_fences(input);
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(s[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a structured answer into `T`.
pub fn parse_structured<T: DeserializeOwned>(input: &str) -> Result<T, String> {
    let json = extract_json(input).ok_or_else(|| "no JSON object in answer".to_string())?;
    serde_json::from_str(&json).map_err(|e| format!("malformed JSON answer: {e}"))
}

/// Count of non-whitespace characters; the length measure used by every
/// plausibility check so that reflowed whitespace never counts as loss.
pub fn content_len(s: &str) -> usize {
    s.chars().filter(|c| !c.is_whitespace()).count()
}

/// Collapse internal whitespace runs to single spaces and trim.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn strips_outer_fences() {
        let input = "```markdown\nHello\n\nWorld\n```";
        assert_eq!(clean_page_text(input), "Hello\n\nWorld");
        let input = "```\nplain\n```\n";
        assert_eq!(clean_page_text(input), "plain");
    }

    #[test]
    fn keeps_inner_fences() {
        let input = "Intro\n```rust\nfn main() {}\n```\nOutro";
        assert_eq!(clean_page_text(input), input);
    }

    #[test]
    fn normalises_whitespace() {
        let input = "a  \r\nb\r\n\r\n\r\n\r\nc\u{200B}\n";
        assert_eq!(clean_page_text(input), "a\nb\n\nc");
    }

    #[test]
    fn extracts_json_from_prose() {
        let input = "Sure! Here it is:\n```json\n{\"a\": {\"b\": \"}\"}}\n```";
        assert_eq!(extract_json(input).as_deref(), Some("{\"a\": {\"b\": \"}\"}}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{ unbalanced"), None);
    }

    #[test]
    fn parse_structured_reports_problems() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct T {
            n: u32,
        }
        assert_eq!(parse_structured::<T>("{\"n\": 3}"), Ok(T { n: 3 }));
        assert!(parse_structured::<T>("{\"n\": \"x\"}")
            .unwrap_err()
            .contains("malformed"));
        assert!(parse_structured::<T>("nothing").unwrap_err().contains("no JSON"));
    }

    #[test]
    fn content_len_ignores_whitespace() {
        assert_eq!(content_len("a b\n\nc\t"), 3);
        assert_eq!(content_len("   "), 0);
        assert_eq!(squash_whitespace("  a \n b  "), "a b");
    }
}
