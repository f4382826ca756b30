//! Text extraction for fetched content.
//!
//! [`ContentExtractor`] turns raw bytes into normalized text: HTML pages are
//! reduced to their main content and converted to Markdown with `htmd`,
//! JSON is pretty-printed, and Markdown/plain text are decoded and tidied.
//! A series of cleanup passes runs afterwards and is reported back as
//! cleaning metadata.

mod cleanup;
mod html;

use async_trait::async_trait;
use kbingest_shared::{IngestError, Metadata, ProcessOptions, ProcessedContent, Processor, Result};
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

pub use cleanup::CleanupReport;

/// Content types this extractor accepts.
pub const SUPPORTED_TYPES: &[&str] = &["webpage", "markdown", "text", "data"];

/// How a payload gets decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Html,
    Json,
    Markdown,
    Text,
}

impl Format {
    /// The MIME type wins over the classifier's guess.
    fn detect(content_type: &str, mime_type: &str) -> Self {
        let mime = mime_type.to_lowercase();
        if mime.contains("html") {
            Format::Html
        } else if mime.contains("json") {
            Format::Json
        } else if mime.contains("markdown") {
            Format::Markdown
        } else if mime.starts_with("text/") {
            Format::Text
        } else {
            match content_type {
                "webpage" => Format::Html,
                "markdown" => Format::Markdown,
                _ => Format::Text,
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Format::Html => "html",
            Format::Json => "json",
            Format::Markdown => "markdown",
            Format::Text => "text",
        }
    }
}

/// Default [`Processor`]: HTML, Markdown, plain text and JSON.
#[derive(Debug, Clone, Default)]
pub struct ContentExtractor;

impl ContentExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Processor for ContentExtractor {
    fn can_process(&self, content_type: &str) -> bool {
        SUPPORTED_TYPES.contains(&content_type)
    }

    #[instrument(skip_all, fields(url = %options.url, content_type = %content_type))]
    async fn process(
        &self,
        content: &[u8],
        content_type: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedContent> {
        if !self.can_process(content_type) {
            return Err(IngestError::validation(format!(
                "unsupported content type '{content_type}'"
            )));
        }

        let format = Format::detect(content_type, &options.mime_type);
        let decoded = String::from_utf8_lossy(content);
        let mut metadata = Metadata::new();
        metadata.insert("format".into(), json!(format.as_str()));

        let (text, title, report) = match format {
            Format::Html => {
                let doc = html::html_to_markdown(&decoded)?;
                let base = Url::parse(&options.url).ok();
                let (text, report) = cleanup::clean_markdown(&doc.markdown, base.as_ref());
                metadata.insert("container".into(), json!(doc.container));
                metadata.insert("tables".into(), json!(doc.tables));
                let title = doc.title.or_else(|| first_heading(&text));
                (text, title, report)
            }
            Format::Json => {
                let value: serde_json::Value = serde_json::from_slice(content)
                    .map_err(|e| IngestError::parse(format!("invalid JSON: {e}")))?;
                let pretty = serde_json::to_string_pretty(&value)
                    .map_err(|e| IngestError::parse(format!("JSON re-encoding failed: {e}")))?;
                let (text, report) = cleanup::clean_text(&pretty);
                let title = value
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
                (text, title, report)
            }
            Format::Markdown => {
                let (text, report) = cleanup::clean_text(&decoded);
                let title = first_heading(&text);
                (text, title, report)
            }
            Format::Text => {
                let (text, report) = cleanup::clean_text(&decoded);
                (text, None, report)
            }
        };

        metadata.insert("word_count".into(), json!(text.split_whitespace().count()));
        metadata.insert("char_count".into(), json!(text.chars().count()));
        debug!(format = format.as_str(), chars = text.len(), "extracted text");

        Ok(ProcessedContent {
            text,
            title,
            metadata,
            cleaning_metadata: serde_json::to_value(&report).ok(),
        })
    }
}

/// Text of the first `# ` heading.
fn first_heading(md: &str) -> Option<String> {
    md.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(url: &str, mime: &str) -> ProcessOptions {
        ProcessOptions {
            url: url.into(),
            mime_type: mime.into(),
            overrides: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn html_page_becomes_markdown() {
        let html = br#"<html><head><title>Docs</title></head><body><main>
            <h1>Install</h1><p>See <a href="/setup">setup</a>.</p>
        </main></body></html>"#;

        let out = ContentExtractor::new()
            .process(html, "webpage", &opts("https://a.com/docs/", "text/html"))
            .await
            .unwrap();
        assert_eq!(out.title.as_deref(), Some("Docs"));
        assert!(out.text.contains("# Install"));
        assert!(out.text.contains("[setup](https://a.com/setup)"));
        assert_eq!(out.metadata["format"], "html");
        assert!(out.cleaning_metadata.is_some());
    }

    #[tokio::test]
    async fn plain_text_is_tidied() {
        let out = ContentExtractor::new()
            .process(b"hello   \r\nworld", "text", &opts("https://a.com/x.txt", "text/plain"))
            .await
            .unwrap();
        assert_eq!(out.text, "hello\nworld\n");
        assert!(out.title.is_none());
        assert_eq!(out.metadata["word_count"], 2);
    }

    #[tokio::test]
    async fn json_is_pretty_printed() {
        let out = ContentExtractor::new()
            .process(
                br#"{"title":"Feed","items":[1,2]}"#,
                "data",
                &opts("https://a.com/feed.json", "application/json"),
            )
            .await
            .unwrap();
        assert_eq!(out.title.as_deref(), Some("Feed"));
        assert!(out.text.contains("\"items\": ["));

        let err = ContentExtractor::new()
            .process(b"{nope", "data", &opts("https://a.com/x", "application/json"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
    }

    #[tokio::test]
    async fn markdown_title_from_heading() {
        let out = ContentExtractor::new()
            .process(
                b"# Readme\n\nBody",
                "markdown",
                &opts("https://a.com/README.md", "text/markdown"),
            )
            .await
            .unwrap();
        assert_eq!(out.title.as_deref(), Some("Readme"));
    }

    #[test]
    fn images_are_not_processable() {
        let extractor = ContentExtractor::new();
        assert!(extractor.can_process("webpage"));
        assert!(!extractor.can_process("image"));
        assert!(!extractor.can_process("document"));
    }

    #[test]
    fn mime_overrides_classification() {
        assert_eq!(Format::detect("text", "text/html; charset=utf-8"), Format::Html);
        assert_eq!(Format::detect("webpage", "application/octet-stream"), Format::Html);
        assert_eq!(Format::detect("data", "text/csv"), Format::Text);
    }
}
