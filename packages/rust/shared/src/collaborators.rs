//! Collaborator interfaces consumed by the ingestion pipeline.
//!
//! The orchestrator only ever sees these traits; concrete backends (HTTP
//! fetcher, HTML extractor, libSQL store, ...) live in their own crates and are
//! injected as `Arc<dyn Trait>`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{KnowledgeEntry, Metadata};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What kind of content a URL points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Content type key (e.g. `webpage`, `text`, `document`).
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// 0.0..=1.0
    pub confidence: f32,
}

/// Decides what a URL is before anything is fetched.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn can_handle(&self, url: &str) -> bool;

    async fn detect(&self, url: &str) -> Result<Classification>;
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Per-request fetch options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub timeout: Option<Duration>,
    /// Scraper-specific overrides; backends ignore keys they don't know.
    pub overrides: Metadata,
}

/// Backend-reported details about a fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraping_issues: Option<serde_json::Value>,
}

/// Raw bytes plus transport details.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub content: Vec<u8>,
    pub mime_type: String,
    pub size: u64,
    pub headers: BTreeMap<String, String>,
    pub metadata: FetchMetadata,
}

/// Retrieves raw content for a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn can_fetch(&self, url: &str) -> bool;

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedContent>;
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// Options passed to a content processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub url: String,
    pub mime_type: String,
    pub overrides: Metadata,
}

/// Normalized text extracted from raw content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaning_metadata: Option<serde_json::Value>,
}

/// Turns raw bytes of a given content type into text.
#[async_trait]
pub trait Processor: Send + Sync {
    fn can_process(&self, content_type: &str) -> bool;

    async fn process(
        &self,
        content: &[u8],
        content_type: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessedContent>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Persists indexed knowledge entries.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Store an entry and return its id. Storing identical content for the
    /// same URL again updates the existing row and returns its id.
    async fn store(&self, entry: &KnowledgeEntry) -> Result<String>;

    async fn retrieve(&self, id: &str) -> Result<Option<KnowledgeEntry>>;
}

/// Options for storing raw files.
#[derive(Debug, Clone, Default)]
pub struct FileStoreOptions {
    pub metadata: Metadata,
}

/// Persists raw fetched bytes and returns where they landed.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn store(&self, bytes: &[u8], filename: &str, options: &FileStoreOptions)
    -> Result<String>;
}

/// Outcome of a change check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCheck {
    pub has_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub current_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

/// Remembers what content was last processed for a URL.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    async fn has_content_changed(
        &self,
        url: &str,
        hash: &str,
        metadata: Option<&Metadata>,
    ) -> Result<ChangeCheck>;

    async fn record_content_processed(
        &self,
        url: &str,
        hash: &str,
        metadata: Option<&Metadata>,
    ) -> Result<()>;
}

/// A stored original file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalFileInfo {
    pub url_id: String,
    pub url: String,
    pub file_path: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub checksum: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Optional bookkeeping of stored original files.
#[async_trait]
pub trait OriginalFileTracker: Send + Sync {
    async fn record_original_file(&self, info: &OriginalFileInfo) -> Result<String>;
}
