//! HTML → Markdown conversion.

use std::sync::LazyLock;

use kbingest_shared::{IngestError, Result};
use scraper::{ElementRef, Html, Selector};

/// Containers tried in order when looking for the main content.
const CONTENT_SELECTORS: &[&str] = &[
    "article .markdown",
    ".vp-doc",
    ".markdown-section",
    "[role=\"main\"]",
    "article",
    "main",
    ".content",
    "body",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "nav", "iframe", "noscript", "svg", "form"];

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));

/// A parsed page reduced to Markdown.
#[derive(Debug, Clone)]
pub(crate) struct HtmlDocument {
    pub title: Option<String>,
    pub markdown: String,
    pub container: &'static str,
    pub tables: usize,
}

/// Convert a full HTML document to Markdown, keeping only the main content.
pub(crate) fn html_to_markdown(html: &str) -> Result<HtmlDocument> {
    let doc = Html::parse_document(html);
    let title = page_title(&doc);

    let (container, content_html) = main_content(&doc).unwrap_or(("document", html.to_string()));
    let (content_html, tables) = tables_to_markdown(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();
    let markdown = converter
        .convert(&content_html)
        .map_err(|e| IngestError::Conversion(format!("htmd conversion failed: {e}")))?;

    Ok(HtmlDocument {
        title,
        markdown,
        container,
        tables,
    })
}

/// `<title>` text, else the first `<h1>`.
fn page_title(doc: &Html) -> Option<String> {
    [&*TITLE_SEL, &*H1_SEL].into_iter().find_map(|sel| {
        doc.select(sel)
            .map(|el| collapse_ws(&el.text().collect::<String>()))
            .find(|t| !t.is_empty())
    })
}

fn main_content(doc: &Html) -> Option<(&'static str, String)> {
    CONTENT_SELECTORS.iter().find_map(|sel_str| {
        let selector = Selector::parse(sel_str).ok()?;
        doc.select(&selector)
            .next()
            .map(|el| (*sel_str, el.inner_html()))
    })
}

/// Replace `<table>` elements with Markdown tables; htmd leaves them as HTML.
fn tables_to_markdown(html: &str) -> (String, usize) {
    let fragment = Html::parse_fragment(html);
    let mut result = html.to_string();
    let mut converted = 0;

    for table in fragment.select(&TABLE_SEL) {
        let markdown = table_markdown(&table);
        let outer = table.html();
        if result.contains(&outer) {
            result = result.replacen(&outer, &markdown, 1);
            converted += 1;
        }
    }
    (result, converted)
}

fn table_markdown(table: &ElementRef) -> String {
    let rows: Vec<Vec<String>> = table
        .select(&ROW_SEL)
        .map(|tr| {
            tr.select(&CELL_SEL)
                .map(|cell| collapse_ws(&cell.text().collect::<String>()))
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }

    let line = |cells: &[String]| {
        let mut padded = cells.to_vec();
        padded.resize(width, String::new());
        format!("| {} |\n", padded.join(" | "))
    };

    let mut md = String::from("\n\n");
    md.push_str(&line(&rows[0]));
    md.push_str(&line(&vec!["---".to_string(); width]));
    for row in &rows[1..] {
        md.push_str(&line(row));
    }
    md.push('\n');
    md
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_content_wins_over_chrome() {
        let html = r#"<html><head><title>Guide | Site</title></head><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Guide</h1><p>Important text.</p></main>
            <footer><p>Copyright 2024</p></footer>
        </body></html>"#;

        let doc = html_to_markdown(html).unwrap();
        assert_eq!(doc.title.as_deref(), Some("Guide | Site"));
        assert_eq!(doc.container, "main");
        assert!(doc.markdown.contains("# Guide"));
        assert!(doc.markdown.contains("Important text."));
        assert!(!doc.markdown.contains("Copyright"));
    }

    #[test]
    fn title_falls_back_to_h1() {
        let doc = html_to_markdown("<html><body><h1>  Only   Heading </h1></body></html>").unwrap();
        assert_eq!(doc.title.as_deref(), Some("Only Heading"));
        assert_eq!(doc.container, "body");
    }

    #[test]
    fn tables_become_markdown() {
        let html = r#"<html><body><main><table>
            <thead><tr><th>Name</th><th>Value</th></tr></thead>
            <tbody>
                <tr><td>foo</td><td>bar</td></tr>
                <tr><td>baz</td></tr>
            </tbody>
        </table></main></body></html>"#;

        let doc = html_to_markdown(html).unwrap();
        assert_eq!(doc.tables, 1);
        assert!(doc.markdown.contains("| Name | Value |"));
        assert!(doc.markdown.contains("| foo | bar |"));
        assert!(doc.markdown.contains("| baz |"));
    }

    #[test]
    fn code_blocks_keep_language() {
        let html = r#"<html><body><main><pre><code class="language-rust">fn main() {}</code></pre></main></body></html>"#;
        let doc = html_to_markdown(html).unwrap();
        assert!(doc.markdown.contains("```rust"));
        assert!(doc.markdown.contains("fn main() {}"));
    }
}
