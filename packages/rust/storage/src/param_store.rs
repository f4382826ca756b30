//! Persisted scraper parameters behind an in-memory TTL cache.
//!
//! Writes go to the cache first and then to `scraper_params`; reads serve a
//! fresh cache entry or fall through to the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kbingest_shared::{Metadata, Result, normalize_url};
use libsql::params;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{Storage, col_string, db_err, metadata_json, parse_metadata, parse_timestamp};

/// Scraper overrides stored for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperParams {
    /// Normalized URL the parameters apply to.
    pub url: String,
    pub scraper_type: String,
    pub params: Metadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedParams {
    params: ScraperParams,
    cached_at: Instant,
}

/// Read-through/write-through store for [`ScraperParams`].
#[derive(Clone)]
pub struct ScraperParamStore {
    storage: Storage,
    cache: Arc<RwLock<HashMap<String, CachedParams>>>,
    ttl: Duration,
}

impl ScraperParamStore {
    pub fn new(storage: Storage, ttl: Duration) -> Self {
        Self {
            storage,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Cache and persist parameters for `url`. A failed write evicts the
    /// cache entry so readers never see unpersisted data after an error.
    pub async fn set(&self, url: &str, scraper_type: &str, params: Metadata) -> Result<ScraperParams> {
        let normalized = normalize_url(url);
        let record = ScraperParams {
            url: normalized.clone(),
            scraper_type: scraper_type.to_string(),
            params,
            updated_at: Utc::now(),
        };

        self.cache.write().await.insert(
            normalized.clone(),
            CachedParams {
                params: record.clone(),
                cached_at: Instant::now(),
            },
        );

        if let Err(e) = self.persist(&record).await {
            self.cache.write().await.remove(&normalized);
            return Err(e);
        }
        Ok(record)
    }

    /// Parameters for `url`, from cache when fresh.
    pub async fn get(&self, url: &str) -> Result<Option<ScraperParams>> {
        let normalized = normalize_url(url);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&normalized) {
                if cached.cached_at.elapsed() < self.ttl {
                    return Ok(Some(cached.params.clone()));
                }
            }
        }

        let loaded = self.load(&normalized).await?;
        let mut cache = self.cache.write().await;
        match &loaded {
            Some(params) => {
                cache.insert(
                    normalized,
                    CachedParams {
                        params: params.clone(),
                        cached_at: Instant::now(),
                    },
                );
            }
            None => {
                cache.remove(&normalized);
            }
        }
        Ok(loaded)
    }

    pub async fn remove(&self, url: &str) -> Result<bool> {
        self.storage.check_writable()?;
        let normalized = normalize_url(url);
        self.cache.write().await.remove(&normalized);
        let removed = self
            .storage
            .conn()
            .execute(
                "DELETE FROM scraper_params WHERE normalized_url = ?1",
                params![normalized.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Drop stale cache entries; returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, cached| cached.cached_at.elapsed() < self.ttl);
        before - cache.len()
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn persist(&self, record: &ScraperParams) -> Result<()> {
        self.storage.check_writable()?;
        self.storage
            .conn()
            .execute(
                "INSERT INTO scraper_params (normalized_url, scraper_type, params_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(normalized_url) DO UPDATE SET
                   scraper_type = excluded.scraper_type,
                   params_json = excluded.params_json,
                   updated_at = excluded.updated_at",
                params![
                    record.url.as_str(),
                    record.scraper_type.as_str(),
                    metadata_json(&record.params)?,
                    record.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(db_err)?;
        tracing::debug!(url = %record.url, scraper = %record.scraper_type, "persisted scraper params");
        Ok(())
    }

    async fn load(&self, normalized: &str) -> Result<Option<ScraperParams>> {
        let mut rows = self
            .storage
            .conn()
            .query(
                "SELECT normalized_url, scraper_type, params_json, updated_at
                 FROM scraper_params WHERE normalized_url = ?1",
                params![normalized],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(ScraperParams {
                url: col_string(&row, 0)?,
                scraper_type: col_string(&row, 1)?,
                params: parse_metadata(&col_string(&row, 2)?)?,
                updated_at: parse_timestamp(&col_string(&row, 3)?)?,
            })),
            None => Ok(None),
        }
    }
}
