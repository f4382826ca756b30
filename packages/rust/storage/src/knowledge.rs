//! Knowledge entries, original-file records and full-text search.

use async_trait::async_trait;
use kbingest_shared::{
    IngestError, KnowledgeEntry, KnowledgeStore, OriginalFileInfo, OriginalFileTracker, Result,
};
use libsql::params;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    Storage, col_string, db_err, metadata_json, now_rfc3339, parse_metadata, parse_timestamp,
};

const ENTRY_COLUMNS: &str = "id, url_id, url, title, content_type, content, metadata_json, \
     tags_json, size, checksum, status, created_at, updated_at";

/// One full-text search match.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySearchHit {
    pub entry_id: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
impl KnowledgeStore for Storage {
    async fn store(&self, entry: &KnowledgeEntry) -> Result<String> {
        self.check_writable()?;
        let tags_json = serde_json::to_string(&entry.tags)
            .map_err(|e| IngestError::Storage(format!("tag serialization failed: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO knowledge_entries
                   (id, url_id, url, title, content_type, content, metadata_json, tags_json,
                    size, checksum, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(url_id, checksum) DO UPDATE SET
                   url = excluded.url,
                   title = excluded.title,
                   content_type = excluded.content_type,
                   content = excluded.content,
                   metadata_json = excluded.metadata_json,
                   tags_json = excluded.tags_json,
                   size = excluded.size,
                   status = excluded.status,
                   updated_at = excluded.updated_at",
                params![
                    entry.id.as_str(),
                    entry.url_id.as_str(),
                    entry.url.as_str(),
                    entry.title.as_str(),
                    entry.content_type.as_str(),
                    entry.content.as_str(),
                    metadata_json(&entry.metadata)?,
                    tags_json,
                    entry.size as i64,
                    entry.checksum.as_str(),
                    entry.status.as_str(),
                    entry.created_at.to_rfc3339(),
                    entry.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(db_err)?;

        // On conflict the existing row keeps its id.
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM knowledge_entries WHERE url_id = ?1 AND checksum = ?2",
                params![entry.url_id.as_str(), entry.checksum.as_str()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => col_string(&row, 0),
            None => Err(IngestError::Storage(format!(
                "knowledge entry for {} vanished after upsert",
                entry.url
            ))),
        }
    }

    async fn retrieve(&self, id: &str) -> Result<Option<KnowledgeEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM knowledge_entries WHERE id = ?1");
        let mut rows = self.conn().query(&sql, params![id]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_entry(&row)?)),
            None => Ok(None),
        }
    }
}

impl Storage {
    /// Entries of a URL, newest first.
    pub async fn list_entries_for_url(&self, url_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries WHERE url_id = ?1 ORDER BY updated_at DESC"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![url_id])
            .await
            .map_err(db_err)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    pub async fn delete_entry(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let removed = self
            .conn()
            .execute("DELETE FROM knowledge_entries WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    pub async fn count_entries(&self) -> Result<u64> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM knowledge_entries", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    /// Full-text search over entry titles and content (FTS5 query syntax).
    pub async fn search_entries(&self, query: &str, limit: u32) -> Result<Vec<EntrySearchHit>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT e.id, e.url, e.title,
                        snippet(knowledge_fts, 1, '[', ']', '...', 16)
                 FROM knowledge_fts
                 JOIN knowledge_entries e ON e.rowid = knowledge_fts.rowid
                 WHERE knowledge_fts MATCH ?1
                 ORDER BY bm25(knowledge_fts)
                 LIMIT ?2",
                params![query, i64::from(limit)],
            )
            .await
            .map_err(db_err)?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            hits.push(EntrySearchHit {
                entry_id: col_string(&row, 0)?,
                url: col_string(&row, 1)?,
                title: col_string(&row, 2)?,
                snippet: col_string(&row, 3)?,
            });
        }
        Ok(hits)
    }

    /// Number of original files recorded for a URL.
    pub async fn count_original_files(&self, url_id: &str) -> Result<u64> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM original_files WHERE url_id = ?1",
                params![url_id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl OriginalFileTracker for Storage {
    async fn record_original_file(&self, info: &OriginalFileInfo) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = now_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO original_files
                   (id, url_id, url, file_path, filename, mime_type, size, checksum, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(file_path) DO UPDATE SET
                   url_id = excluded.url_id,
                   url = excluded.url,
                   filename = excluded.filename,
                   mime_type = excluded.mime_type,
                   size = excluded.size,
                   checksum = excluded.checksum,
                   metadata_json = excluded.metadata_json",
                params![
                    id.as_str(),
                    info.url_id.as_str(),
                    info.url.as_str(),
                    info.file_path.as_str(),
                    info.filename.as_str(),
                    info.mime_type.as_str(),
                    info.size as i64,
                    info.checksum.as_str(),
                    metadata_json(&info.metadata)?,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM original_files WHERE file_path = ?1",
                params![info.file_path.as_str()],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => col_string(&row, 0),
            None => Err(IngestError::Storage(format!(
                "original file record for {} vanished after upsert",
                info.file_path
            ))),
        }
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<KnowledgeEntry> {
    let tags: Vec<String> = serde_json::from_str(&col_string(row, 7)?)
        .map_err(|e| IngestError::Storage(format!("invalid tags json: {e}")))?;

    Ok(KnowledgeEntry {
        id: col_string(row, 0)?,
        url_id: col_string(row, 1)?,
        url: col_string(row, 2)?,
        title: col_string(row, 3)?,
        content_type: col_string(row, 4)?,
        content: col_string(row, 5)?,
        metadata: parse_metadata(&col_string(row, 6)?)?,
        tags,
        size: row.get::<i64>(8).map_err(db_err)?.max(0) as u64,
        checksum: col_string(row, 9)?,
        status: col_string(row, 10)?.parse()?,
        created_at: parse_timestamp(&col_string(row, 11)?)?,
        updated_at: parse_timestamp(&col_string(row, 12)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UrlRepository;
    use crate::test_support::test_storage;
    use chrono::Utc;
    use kbingest_shared::{EntryStatus, Metadata, content_hash};

    fn entry(id: &str, url_id: &str, content: &str) -> KnowledgeEntry {
        let now = Utc::now();
        KnowledgeEntry {
            id: id.into(),
            url_id: url_id.into(),
            url: "https://a.com/guide".into(),
            title: "Guide".into(),
            content_type: "webpage".into(),
            content: content.into(),
            metadata: Metadata::new(),
            tags: vec!["webpage".into(), "a.com".into()],
            size: content.len() as u64,
            checksum: content_hash(content.as_bytes()),
            status: EntryStatus::Completed,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn store_upserts_on_same_checksum() {
        let storage = test_storage().await;
        let url_id = UrlRepository::new(storage.clone())
            .register("https://a.com/guide", None)
            .await
            .unwrap();

        let first = storage
            .store(&entry("entry_1", &url_id, "hello"))
            .await
            .unwrap();
        assert_eq!(first, "entry_1");

        let mut again = entry("entry_2", &url_id, "hello");
        again.title = "Guide v2".into();
        let second = storage.store(&again).await.unwrap();
        assert_eq!(second, "entry_1");
        assert_eq!(storage.count_entries().await.unwrap(), 1);

        let stored = storage.retrieve("entry_1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Guide v2");
        assert_eq!(stored.tags, vec!["webpage", "a.com"]);
        assert_eq!(stored.status, EntryStatus::Completed);

        storage
            .store(&entry("entry_3", &url_id, "changed"))
            .await
            .unwrap();
        assert_eq!(storage.list_entries_for_url(&url_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn full_text_search_finds_entries() {
        let storage = test_storage().await;
        let url_id = UrlRepository::new(storage.clone())
            .register("https://a.com/guide", None)
            .await
            .unwrap();
        storage
            .store(&entry("entry_1", &url_id, "ownership and borrowing explained"))
            .await
            .unwrap();

        let hits = storage.search_entries("borrowing", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "entry_1");
        assert!(hits[0].snippet.contains("[borrowing]"));

        assert!(storage.delete_entry("entry_1").await.unwrap());
        assert!(storage.search_entries("borrowing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn original_files_upsert_by_path() {
        let storage = test_storage().await;
        let url_id = UrlRepository::new(storage.clone())
            .register("https://a.com/guide", None)
            .await
            .unwrap();
        let info = OriginalFileInfo {
            url_id: url_id.clone(),
            url: "https://a.com/guide".into(),
            file_path: "/tmp/2026/01/guide.html".into(),
            filename: "guide.html".into(),
            mime_type: "text/html".into(),
            size: 5,
            checksum: content_hash(b"hello"),
            metadata: Metadata::new(),
        };

        let a = storage.record_original_file(&info).await.unwrap();
        let b = storage.record_original_file(&info).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(storage.count_original_files(&url_id).await.unwrap(), 1);
    }
}
