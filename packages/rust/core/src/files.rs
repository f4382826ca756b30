//! Local file storage for raw fetched content.
//!
//! Files land under `<root>/<yyyy>/<mm>/` named `<hash prefix>-<filename>`,
//! with a `<file>.meta.json` sidecar holding the caller's metadata. Storing
//! the same bytes under the same name twice overwrites in place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use kbingest_shared::{
    FileStorage, FileStoreOptions, IngestError, Metadata, Result, content_hash,
};
use serde::Serialize;
use tracing::{debug, instrument};

const HASH_PREFIX_LEN: usize = 12;
const MAX_FILENAME_LEN: usize = 120;

/// Sidecar written next to each stored file.
#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    filename: &'a str,
    size: usize,
    checksum: &'a str,
    stored_at: String,
    metadata: &'a Metadata,
}

/// [`FileStorage`] backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    #[instrument(skip_all, fields(filename = %filename, size = bytes.len()))]
    async fn store(
        &self,
        bytes: &[u8],
        filename: &str,
        options: &FileStoreOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let dir = self
            .root
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| IngestError::io(&dir, e))?;

        let checksum = content_hash(bytes);
        let name = format!(
            "{}-{}",
            &checksum[..HASH_PREFIX_LEN],
            sanitize_filename(filename)
        );
        let path = dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| IngestError::io(&path, e))?;

        let sidecar = Sidecar {
            filename,
            size: bytes.len(),
            checksum: &checksum,
            stored_at: now.to_rfc3339(),
            metadata: &options.metadata,
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| IngestError::Storage(format!("sidecar serialization failed: {e}")))?;
        let sidecar_path = dir.join(format!("{name}.meta.json"));
        tokio::fs::write(&sidecar_path, json)
            .await
            .map_err(|e| IngestError::io(&sidecar_path, e))?;

        debug!(path = %path.display(), "stored original file");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Keep `[A-Za-z0-9._-]`, replace the rest with `_`, bound the length.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn stores_bytes_and_sidecar() {
        let root = std::env::temp_dir().join(format!("kbingest_files_{}", Uuid::now_v7()));
        let storage = LocalFileStorage::new(&root);

        let mut metadata = Metadata::new();
        metadata.insert("url".into(), json!("https://a.com/"));
        let path = storage
            .store(b"hello", "index.html", &FileStoreOptions { metadata })
            .await
            .unwrap();

        assert!(path.starts_with(root.to_string_lossy().as_ref()));
        assert!(path.ends_with("-index.html"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(format!("{path}.meta.json")).unwrap()).unwrap();
        assert_eq!(sidecar["size"], 5);
        assert_eq!(sidecar["metadata"]["url"], "https://a.com/");
        assert_eq!(sidecar["checksum"], content_hash(b"hello"));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("a b/c?.html"), "a_b_c_.html");
        assert_eq!(sanitize_filename("..."), "content");
        assert_eq!(sanitize_filename(&"x".repeat(500)).len(), MAX_FILENAME_LEN);
    }
}
