//! Change detection over the URL repository's stored hashes.

use async_trait::async_trait;
use kbingest_shared::{ChangeCheck, ChangeDetector, Metadata, Result};
use kbingest_storage::UrlRepository;
use tracing::debug;

/// [`ChangeDetector`] that compares against `urls.content_hash`.
///
/// A URL the repository has never seen, or one with no recorded hash, is
/// always reported as changed.
#[derive(Clone)]
pub struct RepositoryChangeDetector {
    urls: UrlRepository,
}

impl RepositoryChangeDetector {
    pub fn new(urls: UrlRepository) -> Self {
        Self { urls }
    }
}

#[async_trait]
impl ChangeDetector for RepositoryChangeDetector {
    async fn has_content_changed(
        &self,
        url: &str,
        hash: &str,
        _metadata: Option<&Metadata>,
    ) -> Result<ChangeCheck> {
        let Some(record) = self.urls.get_url_info(url).await? else {
            return Ok(ChangeCheck {
                has_changed: true,
                previous_hash: None,
                current_hash: hash.to_string(),
                last_checked: None,
            });
        };

        Ok(ChangeCheck {
            has_changed: record.content_hash.as_deref() != Some(hash),
            previous_hash: record.content_hash,
            current_hash: hash.to_string(),
            last_checked: Some(record.last_checked),
        })
    }

    async fn record_content_processed(
        &self,
        url: &str,
        hash: &str,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let id = self.urls.register(url, metadata).await?;
        let changed = self.urls.update_hash(&id, hash).await?;
        debug!(%url, changed, "recorded processed content hash");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbingest_storage::Storage;
    use uuid::Uuid;

    async fn detector() -> (RepositoryChangeDetector, UrlRepository) {
        let path = std::env::temp_dir().join(format!("kbingest_change_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&path).await.unwrap();
        let urls = UrlRepository::new(storage);
        (RepositoryChangeDetector::new(urls.clone()), urls)
    }

    #[tokio::test]
    async fn unknown_url_has_changed() {
        let (detector, _) = detector().await;
        let check = detector
            .has_content_changed("https://a.com/", "h1", None)
            .await
            .unwrap();
        assert!(check.has_changed);
        assert!(check.previous_hash.is_none());
        assert!(check.last_checked.is_none());
    }

    #[tokio::test]
    async fn recorded_hash_is_unchanged_until_it_differs() {
        let (detector, urls) = detector().await;
        detector
            .record_content_processed("https://a.com/page", "h1", None)
            .await
            .unwrap();

        let same = detector
            .has_content_changed("https://A.com/page/", "h1", None)
            .await
            .unwrap();
        assert!(!same.has_changed);
        assert_eq!(same.previous_hash.as_deref(), Some("h1"));
        assert!(same.last_checked.is_some());

        let other = detector
            .has_content_changed("https://a.com/page", "h2", None)
            .await
            .unwrap();
        assert!(other.has_changed);

        detector
            .record_content_processed("https://a.com/page", "h2", None)
            .await
            .unwrap();
        let record = urls.get_url_info("https://a.com/page").await.unwrap().unwrap();
        assert_eq!(record.content_hash.as_deref(), Some("h2"));
        assert_eq!(record.previous_hash.as_deref(), Some("h1"));
        assert_eq!(record.content_version, 2);
    }
}
