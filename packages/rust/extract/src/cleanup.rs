//! Text cleanup passes applied after extraction.
//!
//! Passes run in order; each one maps text (plus the page URL) to new text. The
//! returned [`CleanupReport`] names the passes that actually changed the text
//! so callers can record what happened to the content.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

/// What a cleanup run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Names of passes that modified the text, in run order.
    pub passes_applied: Vec<&'static str>,
    pub input_chars: usize,
    pub output_chars: usize,
}

type Pass = (&'static str, fn(&str, Option<&Url>) -> String);

/// Passes for Markdown produced from HTML.
const MARKDOWN_PASSES: &[Pass] = &[
    ("demote_extra_h1", demote_extra_h1),
    ("collapse_blank_lines", collapse_blank_lines),
    ("strip_fence_prefixes", strip_fence_prefixes),
    ("strip_layout_tags", strip_layout_tags),
    ("absolutize_links", absolutize_links),
    ("trim_line_ends", trim_line_ends),
];

/// Passes for plain text and pre-formatted Markdown.
const TEXT_PASSES: &[Pass] = &[
    ("normalize_line_endings", normalize_line_endings),
    ("collapse_blank_lines", collapse_blank_lines),
    ("trim_line_ends", trim_line_ends),
];

/// Clean Markdown converted from HTML.
pub(crate) fn clean_markdown(md: &str, base_url: Option<&Url>) -> (String, CleanupReport) {
    run(MARKDOWN_PASSES, md, base_url)
}

/// Clean plain text.
pub(crate) fn clean_text(text: &str) -> (String, CleanupReport) {
    run(TEXT_PASSES, text, None)
}

fn run(passes: &[Pass], input: &str, base_url: Option<&Url>) -> (String, CleanupReport) {
    let mut report = CleanupReport {
        input_chars: input.chars().count(),
        ..CleanupReport::default()
    };

    let mut text = input.to_string();
    for (name, pass) in passes {
        let next = pass(&text, base_url);
        if next != text {
            report.passes_applied.push(*name);
            text = next;
        }
    }

    let text = format!("{}\n", text.trim_matches('\n'));
    report.output_chars = text.chars().count();
    (text, report)
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Keep the first H1; later ones become H2.
fn demote_extra_h1(md: &str, _base: Option<&Url>) -> String {
    let mut seen_h1 = false;
    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            match line.strip_prefix("# ") {
                Some(text) if !in_fence => {
                    if seen_h1 {
                        format!("## {text}")
                    } else {
                        seen_h1 = true;
                        line.to_string()
                    }
                }
                _ => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// At most two consecutive blank lines.
fn collapse_blank_lines(text: &str, _base: Option<&Url>) -> String {
    static BLANK_RUN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*){3,}").expect("valid regex"));

    BLANK_RUN_RE.replace_all(text, "\n\n\n").into_owned()
}

/// ```` ```language-rust ```` → ```` ```rust ````
fn strip_fence_prefixes(md: &str, _base: Option<&Url>) -> String {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(\s*)```(?:language-|lang-|highlight-)(\w+)").expect("valid regex")
    });

    FENCE_RE.replace_all(md, "$1```$2").into_owned()
}

/// Drop layout-only tags that htmd passes through, outside code fences.
fn strip_layout_tags(md: &str, _base: Option<&Url>) -> String {
    static LAYOUT_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary)(?:\s[^>]*)?>",
        )
        .expect("valid regex")
    });

    let mut in_fence = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.to_string();
            }
            if in_fence {
                line.to_string()
            } else {
                LAYOUT_TAG_RE.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve relative link targets against the page URL. Images, anchors and
/// absolute targets are left alone.
fn absolutize_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let (bang, text, href) = (&caps[1], &caps[2], &caps[3]);
            let keep = !bang.is_empty()
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || Url::parse(href).is_ok();
            if keep {
                return caps[0].to_string();
            }
            match base.join(href) {
                Ok(resolved) => format!("[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn trim_line_ends(text: &str, _base: Option<&Url>) -> String {
    text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

fn normalize_line_endings(text: &str, _base: Option<&Url>) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_h1_demoted_outside_fences() {
        let input = "# Title\n\n```sh\n# comment\n```\n\n# Again";
        assert_eq!(
            demote_extra_h1(input, None),
            "# Title\n\n```sh\n# comment\n```\n\n## Again"
        );
    }

    #[test]
    fn blank_runs_collapse() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb", None), "a\n\n\nb");
        assert_eq!(collapse_blank_lines("a\n\nb", None), "a\n\nb");
    }

    #[test]
    fn fence_prefixes_stripped() {
        assert_eq!(
            strip_fence_prefixes("```language-python\nprint()\n```", None),
            "```python\nprint()\n```"
        );
    }

    #[test]
    fn layout_tags_removed_but_code_kept() {
        let input = "<div class=\"note\">Hi</div>\n```html\n<div>x</div>\n```";
        let out = strip_layout_tags(input, None);
        assert!(out.starts_with("Hi\n"));
        assert!(out.contains("<div>x</div>"));
    }

    #[test]
    fn relative_links_resolved() {
        let base = Url::parse("https://docs.example.com/guide/intro").unwrap();
        let input = "[Next](/api) [Top](#top) ![img](logo.png) [Ext](https://x.org/)";
        let out = absolutize_links(input, Some(&base));
        assert_eq!(
            out,
            "[Next](https://docs.example.com/api) [Top](#top) ![img](logo.png) [Ext](https://x.org/)"
        );
    }

    #[test]
    fn report_lists_changing_passes() {
        let (text, report) = clean_text("line one   \r\nline two\r\n\r\n\r\n\r\n\r\nend");
        assert_eq!(text, "line one\nline two\n\n\nend\n");
        assert_eq!(
            report.passes_applied,
            vec!["normalize_line_endings", "collapse_blank_lines", "trim_line_ends"]
        );
        assert!(report.output_chars < report.input_chars);

        let (_, report) = clean_text("already clean");
        assert!(report.passes_applied.is_empty());
    }
}
