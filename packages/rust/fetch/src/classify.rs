//! URL classification from path extension and host.

use async_trait::async_trait;
use kbingest_shared::{Classification, Classifier, IngestError, Metadata, Result};
use serde_json::json;
use url::Url;

/// (extension, content type, MIME type)
const EXTENSIONS: &[(&str, &str, &str)] = &[
    ("html", "webpage", "text/html"),
    ("htm", "webpage", "text/html"),
    ("xhtml", "webpage", "application/xhtml+xml"),
    ("md", "markdown", "text/markdown"),
    ("markdown", "markdown", "text/markdown"),
    ("txt", "text", "text/plain"),
    ("rst", "text", "text/x-rst"),
    ("json", "data", "application/json"),
    ("csv", "data", "text/csv"),
    ("xml", "data", "application/xml"),
    ("pdf", "document", "application/pdf"),
    ("docx", "document", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("png", "image", "image/png"),
    ("jpg", "image", "image/jpeg"),
    ("jpeg", "image", "image/jpeg"),
    ("gif", "image", "image/gif"),
    ("svg", "image", "image/svg+xml"),
];

/// Cheap heuristic classifier: decides by file extension and falls back to
/// `webpage` for extension-less HTTP(S) URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlClassifier;

impl UrlClassifier {
    pub fn new() -> Self {
        Self
    }

    fn classify(url: &Url) -> Classification {
        let extension = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase());

        let mut metadata = Metadata::new();
        metadata.insert("host".into(), json!(url.host_str().unwrap_or_default()));

        if let Some(ext) = extension.as_deref() {
            if let Some((_, content_type, mime)) = EXTENSIONS.iter().find(|(e, _, _)| *e == ext)
            {
                metadata.insert("extension".into(), json!(ext));
                return Classification {
                    content_type: (*content_type).to_string(),
                    mime_type: Some((*mime).to_string()),
                    metadata,
                    confidence: 0.9,
                };
            }
        }

        Classification {
            content_type: "webpage".into(),
            mime_type: None,
            metadata,
            confidence: 0.5,
        }
    }
}

#[async_trait]
impl Classifier for UrlClassifier {
    fn can_handle(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    async fn detect(&self, url: &str) -> Result<Classification> {
        let parsed =
            Url::parse(url).map_err(|e| IngestError::validation(format!("{url}: {e}")))?;
        Ok(Self::classify(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extension_decides_type() {
        let classifier = UrlClassifier::new();
        let c = classifier
            .detect("https://a.com/files/Report.PDF")
            .await
            .unwrap();
        assert_eq!(c.content_type, "document");
        assert_eq!(c.mime_type.as_deref(), Some("application/pdf"));
        assert!(c.confidence > 0.8);

        let c = classifier.detect("https://a.com/readme.md").await.unwrap();
        assert_eq!(c.content_type, "markdown");
    }

    #[tokio::test]
    async fn plain_pages_default_to_webpage() {
        let classifier = UrlClassifier::new();
        let c = classifier.detect("https://docs.rs/tokio/latest/").await.unwrap();
        assert_eq!(c.content_type, "webpage");
        assert!(c.mime_type.is_none());
        assert_eq!(c.metadata["host"], "docs.rs");
    }

    #[test]
    fn handles_only_http() {
        let classifier = UrlClassifier::new();
        assert!(classifier.can_handle("http://a.com"));
        assert!(!classifier.can_handle("mailto:me@a.com"));
        assert!(!classifier.can_handle("::nope::"));
    }
}
