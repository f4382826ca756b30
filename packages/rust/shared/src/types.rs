//! Core domain types for kbingest.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Free-form JSON object attached to URLs, entries and files.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Shallow-merge `partial` into `base`: top-level keys in `partial` win.
pub fn merge_metadata(base: &mut Metadata, partial: &Metadata) {
    for (key, value) in partial {
        base.insert(key.clone(), value.clone());
    }
}

// ---------------------------------------------------------------------------
// URL lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a tracked URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl UrlStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Completed => "completed",
            UrlStatus::Failed => "failed",
            UrlStatus::Skipped => "skipped",
        }
    }

    /// Whether a run has finished with this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UrlStatus::Completed | UrlStatus::Failed | UrlStatus::Skipped
        )
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrlStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(UrlStatus::Pending),
            "processing" => Ok(UrlStatus::Processing),
            "completed" => Ok(UrlStatus::Completed),
            "failed" => Ok(UrlStatus::Failed),
            "skipped" => Ok(UrlStatus::Skipped),
            other => Err(IngestError::validation(format!("unknown URL status '{other}'"))),
        }
    }
}

/// One row per distinct normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    /// Row identifier (UUID v7).
    pub id: String,
    /// URL as first submitted.
    pub url: String,
    /// Canonical form used as the uniqueness key.
    pub normalized_url: String,
    /// SHA-256 of the last processed content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Hash held before the last content change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub status: UrlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_content_change: Option<DateTime<Utc>>,
    /// Number of runs that have claimed this URL.
    pub process_count: u32,
    /// Incremented only when the content hash changes.
    pub content_version: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Filter for listing URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    pub status: Option<UrlStatus>,
    /// Substring match against the normalized URL.
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// A node of the hierarchical tag taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a tag.
#[derive(Debug, Clone, Default)]
pub struct NewTag {
    pub name: String,
    pub parent_id: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

impl NewTag {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Partial update for a tag. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct TagUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub color: Option<Option<String>>,
}

/// Filter for listing tags.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    /// `Some(None)` lists root tags, `Some(Some(id))` children of `id`.
    pub parent_id: Option<Option<String>>,
    /// Substring match against the tag name.
    pub search: Option<String>,
}

// ---------------------------------------------------------------------------
// Knowledge entries
// ---------------------------------------------------------------------------

/// Processing status of a knowledge entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Processing,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(EntryStatus::Processing),
            "completed" => Ok(EntryStatus::Completed),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(IngestError::validation(format!(
                "unknown entry status '{other}'"
            ))),
        }
    }
}

/// One indexed content snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    /// Owning URL row.
    pub url_id: String,
    pub url: String,
    pub title: String,
    pub content_type: String,
    /// Extracted, normalized text.
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Tag names at the time of indexing.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Raw content size in bytes.
    pub size: u64,
    /// SHA-256 of the raw content.
    pub checksum: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_status_roundtrip() {
        for status in [
            UrlStatus::Pending,
            UrlStatus::Processing,
            UrlStatus::Completed,
            UrlStatus::Failed,
            UrlStatus::Skipped,
        ] {
            let parsed: UrlStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<UrlStatus>().is_err());
        assert!(!UrlStatus::Processing.is_terminal());
        assert!(UrlStatus::Skipped.is_terminal());
    }

    #[test]
    fn merge_is_shallow() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}})
            .as_object()
            .cloned()
            .expect("object");
        let partial = json!({"b": 2, "nested": {"x": 9}})
            .as_object()
            .cloned()
            .expect("object");
        merge_metadata(&mut base, &partial);
        assert_eq!(base["a"], 1);
        assert_eq!(base["b"], 2);
        assert_eq!(base["nested"], json!({"x": 9}));
    }
}
