//! URL lifecycle repository: registration, status transitions, content hash
//! history, duplicate lookup and URL↔tag association.

use std::collections::BTreeMap;

use kbingest_shared::{
    IngestError, Metadata, Result, UrlFilter, UrlRecord, UrlStatus, merge_metadata,
    normalize_url,
};
use libsql::params;
use uuid::Uuid;

use crate::{
    Storage, col_opt_string, col_string, db_err, metadata_json, now_rfc3339, parse_metadata,
    parse_timestamp,
};

const URL_COLUMNS: &str = "id, url, normalized_url, content_hash, previous_hash, status, \
     error_message, first_seen, last_checked, last_content_change, process_count, \
     content_version, metadata_json";

/// Repository over the `urls` and `url_tags` tables.
#[derive(Clone)]
pub struct UrlRepository {
    storage: Storage,
}

impl UrlRepository {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Whether a URL (after normalization) is known.
    pub async fn exists(&self, url: &str) -> Result<bool> {
        let normalized = normalize_url(url);
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT 1 FROM urls WHERE normalized_url = ?1",
                params![normalized.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Register a URL and return its id.
    ///
    /// Registering a known URL returns the existing id, shallow-merges
    /// `metadata` into the stored map and touches `last_checked`.
    pub async fn register(&self, url: &str, metadata: Option<&Metadata>) -> Result<String> {
        self.storage.check_writable()?;
        let normalized = normalize_url(url);
        let now = now_rfc3339();
        let id = Uuid::now_v7().to_string();
        let initial = metadata_json(metadata.unwrap_or(&Metadata::new()))?;

        let inserted = self
            .storage
            .conn()
            .execute(
                "INSERT INTO urls (id, url, normalized_url, status, first_seen, last_checked, metadata_json)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4, ?5)
                 ON CONFLICT(normalized_url) DO NOTHING",
                params![id.as_str(), url, normalized.as_str(), now.as_str(), initial],
            )
            .await
            .map_err(db_err)?;

        if inserted > 0 {
            tracing::debug!(url_id = %id, url = %normalized, "registered url");
            return Ok(id);
        }

        let existing = self
            .get_url_info(url)
            .await?
            .ok_or_else(|| IngestError::not_found("url", normalized.clone()))?;

        let mut merged = existing.metadata;
        if let Some(partial) = metadata {
            merge_metadata(&mut merged, partial);
        }
        self.storage
            .conn()
            .execute(
                "UPDATE urls SET last_checked = ?1, metadata_json = ?2 WHERE id = ?3",
                params![now.as_str(), metadata_json(&merged)?, existing.id.as_str()],
            )
            .await
            .map_err(db_err)?;

        Ok(existing.id)
    }

    /// Set the lifecycle status. Moving to `processing` counts as a claim and
    /// increments `process_count`.
    pub async fn update_status(
        &self,
        id: &str,
        status: UrlStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.storage.check_writable()?;
        let now = now_rfc3339();
        let claim = i64::from(status == UrlStatus::Processing);
        let changed = self
            .storage
            .conn()
            .execute(
                "UPDATE urls SET status = ?1, error_message = ?2, last_checked = ?3,
                   process_count = process_count + ?4
                 WHERE id = ?5",
                params![status.as_str(), error_message, now.as_str(), claim, id],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            return Err(IngestError::not_found("url", id));
        }
        Ok(())
    }

    /// Look a URL up by its normalized form.
    pub async fn get_url_info(&self, url: &str) -> Result<Option<UrlRecord>> {
        let normalized = normalize_url(url);
        let sql = format!("SELECT {URL_COLUMNS} FROM urls WHERE normalized_url = ?1");
        self.query_one(&sql, params![normalized.as_str()]).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<UrlRecord>> {
        let sql = format!("SELECT {URL_COLUMNS} FROM urls WHERE id = ?1");
        self.query_one(&sql, params![id]).await
    }

    /// First URL (oldest) whose current content hash is `hash`.
    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<UrlRecord>> {
        let sql = format!(
            "SELECT {URL_COLUMNS} FROM urls WHERE content_hash = ?1 ORDER BY first_seen LIMIT 1"
        );
        self.query_one(&sql, params![hash]).await
    }

    /// A different, completed URL already holding `hash`.
    pub async fn find_duplicate(&self, hash: &str, url: &str) -> Result<Option<UrlRecord>> {
        let normalized = normalize_url(url);
        let sql = format!(
            "SELECT {URL_COLUMNS} FROM urls
             WHERE content_hash = ?1 AND status = 'completed' AND normalized_url != ?2
             ORDER BY first_seen LIMIT 1"
        );
        self.query_one(&sql, params![hash, normalized.as_str()])
            .await
    }

    pub async fn list(&self, filter: &UrlFilter) -> Result<Vec<UrlRecord>> {
        let sql = format!(
            "SELECT {URL_COLUMNS} FROM urls
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR instr(normalized_url, lower(?2)) > 0)
             ORDER BY first_seen DESC
             LIMIT ?3 OFFSET ?4"
        );
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let offset = filter.offset.map(i64::from).unwrap_or(0);
        self.query_many(
            &sql,
            params![
                filter.status.map(UrlStatus::as_str),
                filter.search.as_deref(),
                limit,
                offset
            ],
        )
        .await
    }

    /// Delete a URL row. Tag links, entries and original files cascade.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.storage.check_writable()?;
        let removed = self
            .storage
            .conn()
            .execute("DELETE FROM urls WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    /// Record a newly processed content hash.
    ///
    /// Returns `true` when the hash differs from the stored one; in that case
    /// the old hash moves to `previous_hash` and `content_version` increments.
    pub async fn update_hash(&self, id: &str, hash: &str) -> Result<bool> {
        self.storage.check_writable()?;
        let now = now_rfc3339();
        let conn = self.storage.conn();

        let changed = conn
            .execute(
                "UPDATE urls SET previous_hash = content_hash, content_hash = ?1,
                   content_version = content_version + 1,
                   last_content_change = ?2, last_checked = ?2
                 WHERE id = ?3 AND content_hash IS NOT ?1",
                params![hash, now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        if changed > 0 {
            return Ok(true);
        }

        let touched = conn
            .execute(
                "UPDATE urls SET last_checked = ?1 WHERE id = ?2",
                params![now.as_str(), id],
            )
            .await
            .map_err(db_err)?;
        if touched == 0 {
            return Err(IngestError::not_found("url", id));
        }
        Ok(false)
    }

    /// Shallow-merge `partial` into the stored metadata.
    pub async fn update_metadata(&self, id: &str, partial: &Metadata) -> Result<()> {
        self.storage.check_writable()?;
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| IngestError::not_found("url", id))?;
        let mut merged = record.metadata;
        merge_metadata(&mut merged, partial);
        self.storage
            .conn()
            .execute(
                "UPDATE urls SET metadata_json = ?1 WHERE id = ?2",
                params![metadata_json(&merged)?, id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Number of URLs per lifecycle status.
    pub async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM urls GROUP BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status = col_string(&row, 0)?;
            let count = row.get::<i64>(1).map_err(db_err)?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Tag associations
    // -----------------------------------------------------------------------

    /// Link tags to a URL. Already-linked tags are ignored.
    pub async fn add_tags(&self, url_id: &str, tag_ids: &[String]) -> Result<()> {
        self.storage.check_writable()?;
        let now = now_rfc3339();
        for tag_id in tag_ids {
            self.storage
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO url_tags (url_id, tag_id, created_at) VALUES (?1, ?2, ?3)",
                    params![url_id, tag_id.as_str(), now.as_str()],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub async fn remove_tag(&self, url_id: &str, tag_id: &str) -> Result<bool> {
        self.storage.check_writable()?;
        let removed = self
            .storage
            .conn()
            .execute(
                "DELETE FROM url_tags WHERE url_id = ?1 AND tag_id = ?2",
                params![url_id, tag_id],
            )
            .await
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    /// Replace the full tag set of a URL in one transaction.
    pub async fn set_tags(&self, url_id: &str, tag_ids: &[String]) -> Result<()> {
        self.storage.check_writable()?;
        let now = now_rfc3339();
        let tx = self.storage.begin().await?;
        tx.execute("DELETE FROM url_tags WHERE url_id = ?1", params![url_id])
            .await
            .map_err(db_err)?;
        for tag_id in tag_ids {
            tx.execute(
                "INSERT OR IGNORE INTO url_tags (url_id, tag_id, created_at) VALUES (?1, ?2, ?3)",
                params![url_id, tag_id.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Names of the tags linked to a URL, alphabetically.
    pub async fn tags_for_url(&self, url_id: &str) -> Result<Vec<String>> {
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT t.name FROM url_tags ut JOIN tags t ON t.id = ut.tag_id
                 WHERE ut.url_id = ?1 ORDER BY t.name",
                params![url_id],
            )
            .await
            .map_err(db_err)?;

        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            names.push(col_string(&row, 0)?);
        }
        Ok(names)
    }

    /// URLs matching tag groups.
    ///
    /// Each group is a set of tag ids that count as one requested tag (a tag
    /// plus, optionally, its descendants). A URL matches a group when it
    /// carries any id in it; `require_all` demands a match on every group,
    /// otherwise any group suffices.
    pub async fn list_by_tag_groups(
        &self,
        groups: &[Vec<String>],
        require_all: bool,
    ) -> Result<Vec<UrlRecord>> {
        let mut matched: Option<Vec<String>> = None;
        for group in groups {
            let ids = self.url_ids_for_tags(group).await?;
            matched = Some(match matched {
                None => ids,
                Some(acc) if require_all => acc.into_iter().filter(|id| ids.contains(id)).collect(),
                Some(mut acc) => {
                    for id in ids {
                        if !acc.contains(&id) {
                            acc.push(id);
                        }
                    }
                    acc
                }
            });
        }

        let mut records = Vec::new();
        for id in matched.unwrap_or_default() {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(records)
    }

    async fn url_ids_for_tags(&self, tag_ids: &[String]) -> Result<Vec<String>> {
        let ids_json = serde_json::to_string(tag_ids)
            .map_err(|e| IngestError::Storage(format!("tag id serialization failed: {e}")))?;
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT DISTINCT url_id FROM url_tags
                 WHERE tag_id IN (SELECT value FROM json_each(?1))",
                params![ids_json],
            )
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.push(col_string(&row, 0)?);
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Row mapping
    // -----------------------------------------------------------------------

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<UrlRecord>> {
        let mut rows = self
            .storage
            .conn()
            .query(sql, params)
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_url(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_many(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<UrlRecord>> {
        let mut rows = self
            .storage
            .conn()
            .query(sql, params)
            .await
            .map_err(db_err)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            records.push(row_to_url(&row)?);
        }
        Ok(records)
    }
}

fn row_to_url(row: &libsql::Row) -> Result<UrlRecord> {
    let status: UrlStatus = col_string(row, 5)?.parse()?;
    let last_content_change = match col_opt_string(row, 9) {
        Some(ts) => Some(parse_timestamp(&ts)?),
        None => None,
    };

    Ok(UrlRecord {
        id: col_string(row, 0)?,
        url: col_string(row, 1)?,
        normalized_url: col_string(row, 2)?,
        content_hash: col_opt_string(row, 3),
        previous_hash: col_opt_string(row, 4),
        status,
        error_message: col_opt_string(row, 6),
        first_seen: parse_timestamp(&col_string(row, 7)?)?,
        last_checked: parse_timestamp(&col_string(row, 8)?)?,
        last_content_change,
        process_count: row.get::<i64>(10).map_err(db_err)?.max(0) as u32,
        content_version: row.get::<i64>(11).map_err(db_err)?.max(0) as u32,
        metadata: parse_metadata(&col_string(row, 12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TagManager;
    use crate::test_support::test_storage;
    use kbingest_shared::NewTag;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn register_is_idempotent_under_normalization() {
        let repo = UrlRepository::new(test_storage().await);
        let a = repo
            .register("https://Example.com/docs/?b=2&a=1#top", None)
            .await
            .unwrap();
        let b = repo
            .register("https://example.com/docs?a=1&b=2", None)
            .await
            .unwrap();
        assert_eq!(a, b);

        let all = repo.list(&UrlFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, UrlStatus::Pending);
        assert_eq!(all[0].normalized_url, "https://example.com/docs?a=1&b=2");
        assert_eq!(all[0].process_count, 0);
    }

    #[tokio::test]
    async fn register_merges_metadata_shallowly() {
        let repo = UrlRepository::new(test_storage().await);
        let id = repo
            .register("https://a.com/x", Some(&meta(json!({"source": "cli", "n": 1}))))
            .await
            .unwrap();
        repo.register("https://a.com/x", Some(&meta(json!({"n": 2}))))
            .await
            .unwrap();

        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.metadata["source"], "cli");
        assert_eq!(record.metadata["n"], 2);
    }

    #[tokio::test]
    async fn claim_increments_process_count() {
        let repo = UrlRepository::new(test_storage().await);
        let id = repo.register("https://a.com/x", None).await.unwrap();

        repo.update_status(&id, UrlStatus::Processing, None)
            .await
            .unwrap();
        repo.update_status(&id, UrlStatus::Failed, Some("boom"))
            .await
            .unwrap();
        repo.update_status(&id, UrlStatus::Processing, None)
            .await
            .unwrap();
        repo.update_metadata(&id, &meta(json!({"k": "v"})))
            .await
            .unwrap();

        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.process_count, 2);
        assert_eq!(record.status, UrlStatus::Processing);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn update_status_unknown_id() {
        let repo = UrlRepository::new(test_storage().await);
        let err = repo
            .update_status("nope", UrlStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[tokio::test]
    async fn content_version_is_monotonic() {
        let repo = UrlRepository::new(test_storage().await);
        let id = repo.register("https://a.com/x", None).await.unwrap();

        assert!(repo.update_hash(&id, "h1").await.unwrap());
        assert!(!repo.update_hash(&id, "h1").await.unwrap());
        let after_same = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(after_same.content_version, 1);
        assert!(after_same.previous_hash.is_none());

        assert!(repo.update_hash(&id, "h2").await.unwrap());
        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.content_version, 2);
        assert_eq!(record.content_hash.as_deref(), Some("h2"));
        assert_eq!(record.previous_hash.as_deref(), Some("h1"));
        assert!(record.last_content_change.is_some());
    }

    #[tokio::test]
    async fn duplicate_requires_completed_other_url() {
        let repo = UrlRepository::new(test_storage().await);
        let a = repo.register("https://a.com/1", None).await.unwrap();
        repo.update_hash(&a, "same").await.unwrap();

        // Not completed yet.
        assert!(
            repo.find_duplicate("same", "https://b.com/2")
                .await
                .unwrap()
                .is_none()
        );

        repo.update_status(&a, UrlStatus::Completed, None)
            .await
            .unwrap();
        let dup = repo
            .find_duplicate("same", "https://b.com/2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dup.id, a);

        // A URL is never a duplicate of itself.
        assert!(
            repo.find_duplicate("same", "https://A.com/1/")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.get_by_hash("same").await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn list_filters_and_counts() {
        let repo = UrlRepository::new(test_storage().await);
        let a = repo.register("https://a.com/docs", None).await.unwrap();
        repo.register("https://b.com/blog", None).await.unwrap();
        repo.update_status(&a, UrlStatus::Completed, None)
            .await
            .unwrap();

        let completed = repo
            .list(&UrlFilter {
                status: Some(UrlStatus::Completed),
                ..UrlFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, a);

        let searched = repo
            .list(&UrlFilter {
                search: Some("BLOG".into()),
                ..UrlFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(searched.len(), 1);

        let limited = repo
            .list(&UrlFilter {
                limit: Some(1),
                ..UrlFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.get("completed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));

        assert!(repo.remove(&a).await.unwrap());
        assert!(!repo.exists("https://a.com/docs").await.unwrap());
    }

    #[tokio::test]
    async fn tag_links_and_group_queries() {
        let storage = test_storage().await;
        let repo = UrlRepository::new(storage.clone());
        let tags = TagManager::new(storage);

        let rust = tags.create_tag(NewTag::named("rust")).await.unwrap();
        let web = tags.create_tag(NewTag::named("web")).await.unwrap();

        let u1 = repo.register("https://a.com/1", None).await.unwrap();
        let u2 = repo.register("https://a.com/2", None).await.unwrap();
        repo.add_tags(&u1, &[rust.id.clone(), web.id.clone()])
            .await
            .unwrap();
        repo.add_tags(&u1, &[rust.id.clone()]).await.unwrap();
        repo.add_tags(&u2, &[rust.id.clone()]).await.unwrap();

        assert_eq!(repo.tags_for_url(&u1).await.unwrap(), vec!["rust", "web"]);

        let groups = vec![vec![rust.id.clone()], vec![web.id.clone()]];
        let any = repo.list_by_tag_groups(&groups, false).await.unwrap();
        assert_eq!(any.len(), 2);
        let all = repo.list_by_tag_groups(&groups, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, u1);

        repo.set_tags(&u1, &[web.id.clone()]).await.unwrap();
        assert_eq!(repo.tags_for_url(&u1).await.unwrap(), vec!["web"]);
        assert!(repo.remove_tag(&u1, &web.id).await.unwrap());
        assert!(repo.tags_for_url(&u1).await.unwrap().is_empty());
    }
}
