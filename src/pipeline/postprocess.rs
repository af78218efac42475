//! Post-processing: deterministic cleanup of extracted page Markdown.
//!
//! Both extractors return Markdown with quirks that are independent of the
//! page content:
//!
//! - Document Intelligence escapes the `![name](url)` annotations written by
//!   the consolidator (`!\[name\](url)`, `doc\_page\_1\_g0.jpg`), so they
//!   would render as literal text instead of images.
//! - Vision models wrap answers in ` ```markdown ` fences, emit `\r\n`, or
//!   forget the separator row of a table.
//!
//! Rules run in a fixed order: fences and line endings first so the later
//! line-based rules see clean input, final newline last.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every cleanup rule to raw extractor output.
///
/// 1. Strip outer markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Restore escaped image references
/// 5. Trim trailing whitespace per line
/// 6. Collapse 3+ consecutive blank lines down to 2
/// 7. Insert a missing GFM table separator row
/// 8. End with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = restore_image_references(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = fix_missing_table_separator(&s);
    ensure_final_newline(&s)
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'], "")
}

// ── Image references ─────────────────────────────────────────────────────
//
// Matches `![alt](url)` with an optional backslash before either bracket.
// Alt text and URL lose their Markdown escapes so the reference points at
// the uploaded object again.

static RE_IMAGE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\\?\[(.*?)\\?\]\(([^)\s]*)\)").unwrap());

fn unescape_markdown(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_punctuation() {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn restore_image_references(input: &str) -> String {
    RE_IMAGE_REF
        .replace_all(input, |caps: &regex::Captures<'_>| {
            format!(
                "![{}]({})",
                unescape_markdown(&caps[1]),
                unescape_markdown(&caps[2])
            )
        })
        .into_owned()
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// A table whose first row is directly followed by a data row gets a
/// separator inserted after the header.
fn fix_missing_table_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    let mut previous_is_table = false;

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let starts_table = is_table_row(line) && !is_separator_row(line) && !previous_is_table;
        previous_is_table = is_table_row(line);
        if !starts_table {
            continue;
        }
        let next = lines.get(i + 1).copied().unwrap_or("");
        if is_table_row(next) && !is_separator_row(next) {
            let columns = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(columns)));
        }
    }
    out.join("\n")
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_fences_with_and_without_language() {
        assert_eq!(strip_markdown_fences("```markdown\n# Hi\nx\n```"), "# Hi\nx");
        assert_eq!(strip_markdown_fences("```\n# Hi\n```"), "# Hi");
        assert_eq!(strip_markdown_fences("# Hi"), "# Hi");
    }

    #[test]
    fn escaped_reference_is_restored() {
        let input = r"Intro !\[doc\_page\_1\_g0.jpg\](https://b.s3.eu-west-1.amazonaws.com/images/doc\_page\_1\_g0.jpg) end";
        assert_eq!(
            restore_image_references(input),
            "Intro ![doc_page_1_g0.jpg](https://b.s3.eu-west-1.amazonaws.com/images/doc_page_1_g0.jpg) end"
        );
    }

    #[test]
    fn plain_reference_is_unchanged() {
        let input = "![a_g0.jpg](http://minio:9000/docs/images/a_g0.jpg)";
        assert_eq!(restore_image_references(input), input);
    }

    #[test]
    fn escapes_outside_references_survive() {
        assert_eq!(restore_image_references(r"5 \* 3 \[not an image\]"), r"5 \* 3 \[not an image\]");
    }

    #[test]
    fn unescape_keeps_lone_backslash() {
        assert_eq!(unescape_markdown(r"a\b\_c\"), r"a\b_c\");
    }

    #[test]
    fn missing_separator_is_inserted_once() {
        let result = fix_missing_table_separator("| A | B |\n| 1 | 2 |\n| 3 | 4 |");
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "| --- | --- |");
    }

    #[test]
    fn complete_table_is_unchanged() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |";
        assert_eq!(fix_missing_table_separator(input), input);
    }

    #[test]
    fn blank_lines_and_final_newline() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn clean_markdown_full_pipeline() {
        let input = "```markdown\n# Title\r\n\r\ntext   \n\n\n\n\n!\\[p\\_g0.jpg\\](https://x/p\\_g0.jpg)\n```";
        let result = clean_markdown(input);
        assert!(result.starts_with("# Title\n\ntext\n"));
        assert!(result.contains("![p_g0.jpg](https://x/p_g0.jpg)"));
        assert!(!result.contains("\n\n\n\n"));
        assert!(result.ends_with(")\n"));
    }
}
