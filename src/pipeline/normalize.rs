//! Normalisation of model output.
//!
//! Vision models echo whatever glyph the form printed: `●`, `◉`, `☒`, `✔`
//! and friends. Validation and downstream parsing only understand two
//! notations, so every selection marker at the start of a line is rewritten:
//!
//! | Glyphs                | Canonical |
//! |-----------------------|-----------|
//! | `●` `◉` `⦿` `(X)` `(•)` | `(x)`     |
//! | `○` `◯` `( )`         | `( )`     |
//! | `☒` `☑` `✓` `✔` `✅` `[X]` | `[x]`     |
//! | `☐` `□` `[ ]`         | `[ ]`     |
//!
//! Every rule maps onto its own canonical output, so [`normalize_response`]
//! is idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean a raw model response and canonicalise its selection markers.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Strip outer markdown fences, however deeply nested
/// 4. Canonicalise selection markers
/// 5. Trim trailing whitespace per line
/// 6. Collapse 3+ consecutive blank lines down to 2
pub fn normalize_response(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = remove_invisible_chars(&s);
    let s = strip_outer_fences(&s);
    let s = normalize_selection_markers(&s);
    let s = trim_trailing_whitespace(&s);
    collapse_blank_lines(&s).trim_matches('\n').to_string()
}

// ── Rule 2: Invisible characters ─────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'))
        .collect()
}

// ── Rule 3: Strip outer fences ───────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:markdown|md)?[ \t]*\n(.*?)\n```[ \t\n]*$").unwrap());

/// Models sometimes wrap an already fenced answer in a second fence.
fn strip_outer_fences(input: &str) -> String {
    let mut s = input.to_string();
    while let Some(inner) = RE_OUTER_FENCE.captures(&s).map(|caps| caps[1].to_string()) {
        s = inner;
    }
    s
}

// ── Rule 4: Selection markers ────────────────────────────────────────────

/// Leading indentation, optional list bullet, then the marker.
static RE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<lead>[ \t]*(?:[-*+][ \t]+)?)(?P<mark>\([ \t]*[xX•][ \t]*\)|\([ \t]*\)|\[[ \t]*[xX][ \t]*\]|\[[ \t]*\]|[●◉⦿○◯☒☑✓✔✅☐□])[ \t]*",
    )
    .unwrap()
});

/// Canonicalise radio and checkbox markers at the start of lines.
pub fn normalize_selection_markers(input: &str) -> String {
    RE_MARKER
        .replace_all(input, |caps: &regex::Captures| {
            let canonical = canonical_marker(&caps["mark"]);
            format!("{}{} ", &caps["lead"], canonical)
        })
        .into_owned()
}

fn canonical_marker(mark: &str) -> &'static str {
    match mark {
        "●" | "◉" | "⦿" => "(x)",
        "○" | "◯" => "( )",
        "☒" | "☑" | "✓" | "✔" | "✅" => "[x]",
        "☐" | "□" => "[ ]",
        m if m.starts_with('(') => {
            if m.chars().any(|c| matches!(c, 'x' | 'X' | '•')) {
                "(x)"
            } else {
                "( )"
            }
        }
        m => {
            if m.chars().any(|c| matches!(c, 'x' | 'X')) {
                "[x]"
            } else {
                "[ ]"
            }
        }
    }
}

// ── Rule 5: Trailing whitespace ──────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 6: Blank lines ──────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_glyphs_become_parentheses() {
        let input = "### Status\n- ● married\n- ○ single\n◉ other\n◯ none";
        assert_eq!(
            normalize_selection_markers(input),
            "### Status\n- (x) married\n- ( ) single\n(x) other\n( ) none"
        );
    }

    #[test]
    fn checkbox_glyphs_become_brackets() {
        let input = "- ☒ a\n- ☐ b\n- ✔ c\n- □ d\n- [X] e";
        assert_eq!(
            normalize_selection_markers(input),
            "- [x] a\n- [ ] b\n- [x] c\n- [ ] d\n- [x] e"
        );
    }

    #[test]
    fn spacing_variants_collapse() {
        assert_eq!(normalize_selection_markers("- ( X )yes"), "- (x) yes");
        assert_eq!(normalize_selection_markers("  -   (  ) no"), "  -   ( ) no");
    }

    #[test]
    fn markers_mid_line_are_untouched() {
        let input = "Answer (x) here and ● there";
        assert_eq!(normalize_selection_markers(input), input);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let input = "```markdown\r\n## 1. Details\r\n- ● yes\r\n- ○ no\r\n- ☑ agree  \r\n\r\n\r\n\r\n\r\nend\u{200B}\r\n```";
        let once = normalize_response(input);
        let twice = normalize_response(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "## 1. Details\n- (x) yes\n- ( ) no\n- [x] agree\n\n\nend");
    }

    #[test]
    fn nested_fences_are_stripped_in_one_pass() {
        let input = "```markdown\n```md\n## 1. Applicant\n- ● yes\n```\n```\n";
        let once = normalize_response(input);
        assert_eq!(once, "## 1. Applicant\n- (x) yes");
        assert_eq!(normalize_response(&once), once);
        let bare_inner = normalize_response("```markdown\n```\n- ● yes\n```\n```");
        assert_eq!(bare_inner, "- (x) yes");
        assert_eq!(normalize_response(&bare_inner), bare_inner);
    }

    #[test]
    fn fence_behind_a_byte_order_mark_is_stripped() {
        let once = normalize_response("\u{FEFF}```\n## 1. Name\n```");
        assert_eq!(once, "## 1. Name");
        assert_eq!(normalize_response(&once), once);
    }

    #[test]
    fn bare_marker_line_is_stable() {
        let once = normalize_response("- ●\n- ○");
        assert_eq!(once, "- (x)\n- ( )");
        assert_eq!(normalize_response(&once), once);
    }

    #[test]
    fn plain_text_passes_through() {
        let input = "Just a paragraph.\nAnother line.";
        assert_eq!(normalize_response(input), input);
    }
}
