//! URL ingestion pipeline: URL → classify → claim → fetch → dedup → extract →
//! store → index.
//!
//! Every run produces a [`ProcessingResult`]; failures are classified into
//! [`ErrorCode`]s scoped to the [`Stage`] they happened in and never escape
//! as errors. Batches run in fixed-size windows so one slow or failing URL
//! cannot abort the others.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use kbingest_shared::{
    ChangeDetector, Classification, Classifier, EntryStatus, ErrorCode, FetchOptions,
    FetchedContent, Fetcher, FileStorage, FileStoreOptions, IngestError, KnowledgeEntry,
    KnowledgeStore, Metadata, OriginalFileInfo, OriginalFileTracker, PipelineConfig,
    ProcessOptions, ProcessedContent, Processor, Result, Stage, StageError, UrlStatus,
    content_hash, extract_domain, normalize_url, url_slug,
};
use kbingest_storage::{ScraperParamStore, Storage, TagManager, UrlRepository};

use crate::ids;
use crate::progress::{ProgressReporter, SilentProgress};
use crate::tracker::{OperationGuard, OperationTracker, Outcome, ProcessingStatus};

// ---------------------------------------------------------------------------
// Options & results
// ---------------------------------------------------------------------------

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Process even when the content hash is unchanged.
    pub force_reprocess: bool,
    /// Skip content already indexed under another URL. `None` uses the
    /// pipeline default.
    pub detect_duplicates: Option<bool>,
    /// Passed to the fetcher and processor. Empty means "use stored params".
    pub scraper_overrides: Metadata,
    /// Extra tag names recorded on the knowledge entry.
    pub tags: Vec<String>,
    /// Batch window size. `None` uses the pipeline default.
    pub concurrency: Option<usize>,
    pub timeout: Option<Duration>,
}

/// Which tagged URLs [`Orchestrator::process_urls_by_tags`] selects.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagQuery {
    /// A tag also matches URLs carrying any of its descendants.
    pub include_descendants: bool,
    /// Require every tag instead of any.
    pub require_all: bool,
}

/// Diagnostics gathered along a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultMetadata {
    pub operation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraper_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scraping_issues: Option<serde_json::Value>,
    /// URL that already owns the same content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
}

/// Outcome of one URL run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub url: String,
    /// `true` for indexed and for unchanged content.
    pub success: bool,
    /// The run stopped early without indexing (unchanged or duplicate).
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub metadata: ResultMetadata,
    /// Stages entered, in order.
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub elapsed_ms: u64,
}

impl ProcessingResult {
    fn failed(url: &str, error: StageError) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            skipped: false,
            entry_id: None,
            url_id: None,
            content_type: None,
            error: Some(error.with_url(url)),
            metadata: ResultMetadata::default(),
            stages: Vec::new(),
            tags: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// The error code, if the run did not succeed.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Backends the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub fetcher: Arc<dyn Fetcher>,
    pub processor: Arc<dyn Processor>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub files: Arc<dyn FileStorage>,
    pub change_detector: Option<Arc<dyn ChangeDetector>>,
    pub file_tracker: Option<Arc<dyn OriginalFileTracker>>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives URLs through the five pipeline stages.
pub struct Orchestrator {
    collab: Collaborators,
    urls: UrlRepository,
    tags: TagManager,
    params: Option<ScraperParamStore>,
    config: PipelineConfig,
    tracker: Arc<OperationTracker>,
    progress: Arc<dyn ProgressReporter>,
}

/// How a pipeline run ended when it did not fail.
enum Finish {
    Indexed,
    Unchanged,
    Duplicate(StageError),
}

/// Mutable state of one run.
struct Run {
    url: String,
    url_id: Option<String>,
    entry_id: Option<String>,
    content_type: Option<String>,
    stages: Vec<Stage>,
    metadata: ResultMetadata,
}

impl Run {
    fn current_stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Detecting)
    }
}

impl Orchestrator {
    pub fn new(storage: Storage, collaborators: Collaborators, config: PipelineConfig) -> Self {
        Self {
            collab: collaborators,
            urls: UrlRepository::new(storage.clone()),
            tags: TagManager::new(storage),
            params: None,
            config,
            tracker: Arc::new(OperationTracker::default()),
            progress: Arc::new(SilentProgress),
        }
    }

    /// Read stored scraper overrides when a run brings none of its own.
    pub fn with_param_store(mut self, params: ScraperParamStore) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn urls(&self) -> &UrlRepository {
        &self.urls
    }

    pub fn tags(&self) -> &TagManager {
        &self.tags
    }

    /// Snapshot of in-flight runs and cumulative counters.
    pub fn get_status(&self) -> ProcessingStatus {
        self.tracker.status()
    }

    /// Run one URL through the pipeline.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn process_url(&self, url: &str, options: &IngestOptions) -> ProcessingResult {
        let start = Instant::now();
        let guard = self.tracker.begin(ids::operation_id(url), url);
        let mut run = Run {
            url: url.to_string(),
            url_id: None,
            entry_id: None,
            content_type: None,
            stages: Vec::new(),
            metadata: ResultMetadata {
                operation_id: guard.operation_id().to_string(),
                ..ResultMetadata::default()
            },
        };

        info!(operation_id = guard.operation_id(), "processing started");

        let caught = AssertUnwindSafe(self.run_pipeline(&mut run, &guard, options))
            .catch_unwind()
            .await;
        let outcome = match caught {
            Ok(outcome) => outcome,
            Err(panic) => Err(StageError::new(
                ErrorCode::UnknownError,
                run.current_stage(),
                format!("{url}: run panicked: {}", panic_message(&*panic)),
            )),
        };

        let result = self.finish(run, outcome, start).await;
        drop(guard);

        info!(
            success = result.success,
            skipped = result.skipped,
            error = result.error.as_ref().map(|e| e.code.as_str()),
            elapsed_ms = result.elapsed_ms,
            "processing finished"
        );
        self.progress.finished(&result);
        result
    }

    /// Run many URLs in windows of `concurrency`, returning results in input
    /// order. A URL repeated within the batch is processed once; later
    /// occurrences fail with `DUPLICATE_URL`.
    #[instrument(skip_all, fields(count = urls.len()))]
    pub async fn process_urls(
        &self,
        urls: &[String],
        options: &IngestOptions,
    ) -> Vec<ProcessingResult> {
        let concurrency = options
            .concurrency
            .unwrap_or(self.config.concurrency)
            .max(1);

        let mut results: Vec<Option<ProcessingResult>> = (0..urls.len()).map(|_| None).collect();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            if seen.insert(normalize_url(url)) {
                pending.push((i, url.as_str()));
            } else {
                let result = ProcessingResult::failed(
                    url,
                    StageError::new(
                        ErrorCode::DuplicateUrl,
                        Stage::Detecting,
                        format!("{url}: already queued in this batch"),
                    ),
                );
                self.tracker.record(Outcome::Failed);
                self.progress.finished(&result);
                results[i] = Some(result);
            }
        }

        for window in pending.chunks(concurrency) {
            let runs = window.iter().map(|&(i, url)| async move {
                (i, self.process_url(url, options).await)
            });
            for (i, result) in join_all(runs).await {
                results[i] = Some(result);
            }
        }

        let results: Vec<ProcessingResult> = results.into_iter().flatten().collect();
        info!(
            total = results.len(),
            succeeded = results.iter().filter(|r| r.success && !r.skipped).count(),
            skipped = results.iter().filter(|r| r.skipped).count(),
            failed = results.iter().filter(|r| !r.success && !r.skipped).count(),
            "batch finished"
        );
        results
    }

    /// Re-run the URL behind a knowledge entry, bypassing the unchanged check.
    pub async fn reprocess_entry(
        &self,
        entry_id: &str,
        options: &IngestOptions,
    ) -> Result<ProcessingResult> {
        let entry = self
            .collab
            .knowledge
            .retrieve(entry_id)
            .await?
            .ok_or_else(|| IngestError::not_found("entry", entry_id))?;

        let options = IngestOptions {
            force_reprocess: true,
            ..options.clone()
        };
        info!(%entry_id, url = %entry.url, "reprocessing entry");
        Ok(self.process_url(&entry.url, &options).await)
    }

    /// Attach tags (created as needed) to `url`, then process it. Tag
    /// failures are logged and do not stop the run.
    #[instrument(skip_all, fields(url = %url, tags = tag_names.len()))]
    pub async fn process_url_with_tags(
        &self,
        url: &str,
        tag_names: &[String],
        options: &IngestOptions,
    ) -> ProcessingResult {
        let mut options = options.clone();
        options.tags.extend(tag_names.iter().cloned());

        if Url::parse(url).is_ok() {
            if let Err(e) = self.link_tags(url, tag_names).await {
                warn!(%url, error = %e, "tag association failed");
            }
        }

        let mut result = self.process_url(url, &options).await;
        self.decorate_tags(&mut result).await;
        result
    }

    /// Process every URL carrying the named tags.
    #[instrument(skip_all, fields(tags = ?tag_names))]
    pub async fn process_urls_by_tags(
        &self,
        tag_names: &[String],
        query: TagQuery,
        options: &IngestOptions,
    ) -> Result<Vec<ProcessingResult>> {
        let mut groups = Vec::new();
        for name in tag_names {
            let Some(tag) = self.tags.get_tag_by_name(name.trim()).await? else {
                if query.require_all {
                    info!(tag = %name, "unknown tag, nothing can match all tags");
                    return Ok(Vec::new());
                }
                warn!(tag = %name, "unknown tag ignored");
                continue;
            };

            let mut ids = vec![tag.id.clone()];
            if query.include_descendants {
                ids.extend(
                    self.tags
                        .get_child_tags(&tag.id, true)
                        .await?
                        .into_iter()
                        .map(|t| t.id),
                );
            }
            groups.push(ids);
        }

        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let targets: Vec<String> = self
            .urls
            .list_by_tag_groups(&groups, query.require_all)
            .await?
            .into_iter()
            .map(|record| record.url)
            .collect();
        info!(urls = targets.len(), "resolved tagged URLs");

        let mut results = self.process_urls(&targets, options).await;
        for result in &mut results {
            self.decorate_tags(result).await;
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn enter(&self, run: &mut Run, guard: &OperationGuard, stage: Stage) {
        debug!(url = %run.url, %stage, "entering stage");
        run.stages.push(stage);
        guard.enter(stage);
        self.progress.stage(&run.url, stage);
    }

    async fn run_pipeline(
        &self,
        run: &mut Run,
        guard: &OperationGuard,
        options: &IngestOptions,
    ) -> std::result::Result<Finish, StageError> {
        let url = run.url.clone();

        // --- DETECTING ---
        self.enter(run, guard, Stage::Detecting);
        if let Err(e) = Url::parse(&url) {
            return Err(StageError::new(
                ErrorCode::InvalidUrl,
                Stage::Detecting,
                format!("{url}: {e}"),
            ));
        }
        if !self.collab.classifier.can_handle(&url) {
            return Err(StageError::new(
                ErrorCode::UnsupportedType,
                Stage::Detecting,
                format!("{url}: no classifier handles this URL"),
            ));
        }
        let Some(_claim) = self.tracker.claim_url(normalize_url(&url)) else {
            return Err(StageError::new(
                ErrorCode::DuplicateUrl,
                Stage::Detecting,
                format!("{url}: already being processed"),
            ));
        };
        let classification = self.collab.classifier.detect(&url).await.map_err(|e| {
            StageError::new(ErrorCode::UnsupportedType, Stage::Detecting, format!("{url}: {e}"))
        })?;
        let content_type = classification.content_type.clone();
        run.content_type = Some(content_type.clone());
        run.metadata.classification = Some(classification.clone());

        // --- Claim ---
        let url_id = self.claim(&url, &classification).await.map_err(|e| {
            StageError::new(
                ErrorCode::StorageFailed,
                Stage::Fetching,
                format!("{url}: could not claim URL: {e}"),
            )
        })?;
        run.url_id = Some(url_id.clone());

        // --- FETCHING ---
        self.enter(run, guard, Stage::Fetching);
        let overrides = self.scraper_overrides(&url, options).await;
        let fetched = self.fetch(&url, options, &overrides).await?;
        run.metadata.scraper_used = fetched.metadata.scraper_used.clone();
        run.metadata.rate_limit_info = fetched.metadata.rate_limit_info.clone();
        run.metadata.scraping_issues = fetched.metadata.scraping_issues.clone();

        let hash = content_hash(&fetched.content);
        run.metadata.content_hash = Some(hash.clone());

        if let Some(detector) = &self.collab.change_detector {
            match detector.has_content_changed(&url, &hash, None).await {
                Ok(check) => {
                    run.metadata.previous_hash = check.previous_hash;
                    run.metadata.last_checked = check.last_checked;
                    if !check.has_changed && !options.force_reprocess {
                        debug!(%url, "content unchanged");
                        return Ok(Finish::Unchanged);
                    }
                }
                Err(e) => warn!(%url, error = %e, "change detection failed, treating as changed"),
            }
        }

        if options
            .detect_duplicates
            .unwrap_or(self.config.detect_duplicates)
        {
            match self.urls.find_duplicate(&hash, &url).await {
                Ok(Some(original)) => {
                    run.metadata.duplicate_of = Some(original.url.clone());
                    return Ok(Finish::Duplicate(StageError::new(
                        ErrorCode::DuplicateContent,
                        Stage::Fetching,
                        format!("{url}: content already indexed from {}", original.url),
                    )));
                }
                Ok(None) => {}
                Err(e) => warn!(%url, error = %e, "duplicate lookup failed, continuing"),
            }
        }

        // --- PROCESSING ---
        self.enter(run, guard, Stage::Processing);
        let mime_type = effective_mime(&fetched, &classification);
        let processed = self
            .extract(&url, &fetched, &content_type, &mime_type, overrides)
            .await?;

        // --- STORING ---
        self.enter(run, guard, Stage::Storing);
        let storage_path = self
            .store_original(&url, &url_id, &fetched, &content_type, &mime_type, &hash, &run.metadata)
            .await?;
        run.metadata.storage_path = Some(storage_path.clone());
        self.merge_url_metadata(&url_id, &run.metadata, &content_type, processed.title.as_deref())
            .await;

        // --- INDEXING ---
        self.enter(run, guard, Stage::Indexing);
        let entry = build_entry(
            &url,
            &url_id,
            &content_type,
            &mime_type,
            &hash,
            &fetched,
            processed,
            &run.metadata,
            &options.tags,
        );
        let entry_id = self.collab.knowledge.store(&entry).await.map_err(|e| {
            StageError::new(
                ErrorCode::StorageFailed,
                Stage::Indexing,
                format!("{url}: failed to index entry: {e}"),
            )
        })?;
        run.entry_id = Some(entry_id);

        if let Err(e) = self.urls.update_hash(&url_id, &hash).await {
            warn!(%url, error = %e, "failed to record content hash");
        }
        if let Some(detector) = &self.collab.change_detector {
            if let Err(e) = detector.record_content_processed(&url, &hash, None).await {
                warn!(%url, error = %e, "change detector did not record content");
            }
        }

        Ok(Finish::Indexed)
    }

    /// Mark the URL PROCESSING, registering it first when unknown.
    async fn claim(&self, url: &str, classification: &Classification) -> Result<String> {
        let id = match self.urls.get_url_info(url).await? {
            Some(record) => record.id,
            None => {
                let mut metadata = Metadata::new();
                metadata.insert("content_type".into(), json!(classification.content_type));
                self.urls.register(url, Some(&metadata)).await?
            }
        };
        self.urls
            .update_status(&id, UrlStatus::Processing, None)
            .await?;
        Ok(id)
    }

    async fn scraper_overrides(&self, url: &str, options: &IngestOptions) -> Metadata {
        if !options.scraper_overrides.is_empty() {
            return options.scraper_overrides.clone();
        }
        let Some(params) = &self.params else {
            return Metadata::new();
        };
        match params.get(url).await {
            Ok(Some(stored)) => {
                debug!(%url, scraper = %stored.scraper_type, "using stored scraper params");
                stored.params
            }
            Ok(None) => Metadata::new(),
            Err(e) => {
                warn!(%url, error = %e, "failed to load scraper params");
                Metadata::new()
            }
        }
    }

    async fn fetch(
        &self,
        url: &str,
        options: &IngestOptions,
        overrides: &Metadata,
    ) -> std::result::Result<FetchedContent, StageError> {
        if !self.collab.fetcher.can_fetch(url) {
            return Err(StageError::new(
                ErrorCode::FetchFailed,
                Stage::Fetching,
                format!("{url}: no fetcher available"),
            ));
        }

        let fetch_options = FetchOptions {
            timeout: options.timeout,
            overrides: overrides.clone(),
        };
        self.collab
            .fetcher
            .fetch(url, &fetch_options)
            .await
            .map_err(|e| {
                let message = e.to_string();
                let code = ErrorCode::from_fetch_message(&message);
                let message = if message.contains(url) {
                    message
                } else {
                    format!("{url}: {message}")
                };
                StageError::new(code, Stage::Fetching, message)
            })
    }

    async fn extract(
        &self,
        url: &str,
        fetched: &FetchedContent,
        content_type: &str,
        mime_type: &str,
        overrides: Metadata,
    ) -> std::result::Result<ProcessedContent, StageError> {
        if !self.collab.processor.can_process(content_type) {
            return Err(StageError::new(
                ErrorCode::ProcessingFailed,
                Stage::Processing,
                format!("{url}: no processor for content type '{content_type}'"),
            ));
        }

        let process_options = ProcessOptions {
            url: url.to_string(),
            mime_type: mime_type.to_string(),
            overrides,
        };
        self.collab
            .processor
            .process(&fetched.content, content_type, &process_options)
            .await
            .map_err(|e| {
                StageError::new(ErrorCode::ProcessingFailed, Stage::Processing, format!("{url}: {e}"))
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_original(
        &self,
        url: &str,
        url_id: &str,
        fetched: &FetchedContent,
        content_type: &str,
        mime_type: &str,
        hash: &str,
        run_metadata: &ResultMetadata,
    ) -> std::result::Result<String, StageError> {
        let filename = format!("{}.{}", url_slug(url), file_extension(mime_type));
        let mut metadata = Metadata::new();
        metadata.insert("url".into(), json!(url));
        metadata.insert("content_type".into(), json!(content_type));
        metadata.insert("mime_type".into(), json!(mime_type));
        metadata.insert("operation_id".into(), json!(run_metadata.operation_id));

        let path = self
            .collab
            .files
            .store(
                &fetched.content,
                &filename,
                &FileStoreOptions {
                    metadata: metadata.clone(),
                },
            )
            .await
            .map_err(|e| {
                StageError::new(
                    ErrorCode::StorageFailed,
                    Stage::Storing,
                    format!("{url}: failed to store original: {e}"),
                )
            })?;

        if let Some(tracker) = &self.collab.file_tracker {
            let info = OriginalFileInfo {
                url_id: url_id.to_string(),
                url: url.to_string(),
                file_path: path.clone(),
                filename,
                mime_type: mime_type.to_string(),
                size: fetched.content.len() as u64,
                checksum: hash.to_string(),
                metadata,
            };
            if let Err(e) = tracker.record_original_file(&info).await {
                warn!(%url, error = %e, "failed to record original file");
            }
        }

        Ok(path)
    }

    async fn merge_url_metadata(
        &self,
        url_id: &str,
        run_metadata: &ResultMetadata,
        content_type: &str,
        title: Option<&str>,
    ) {
        let mut partial = Metadata::new();
        partial.insert("content_type".into(), json!(content_type));
        if let Some(title) = title {
            partial.insert("title".into(), json!(title));
        }
        if let Some(path) = &run_metadata.storage_path {
            partial.insert("storage_path".into(), json!(path));
        }
        if let Some(scraper) = &run_metadata.scraper_used {
            partial.insert("scraper_used".into(), json!(scraper));
        }
        if let Some(info) = &run_metadata.rate_limit_info {
            partial.insert("rate_limit_info".into(), info.clone());
        }
        if let Some(issues) = &run_metadata.scraping_issues {
            partial.insert("scraping_issues".into(), issues.clone());
        }

        if let Err(e) = self.urls.update_metadata(url_id, &partial).await {
            warn!(%url_id, error = %e, "failed to merge URL metadata");
        }
    }

    /// Record the terminal URL status and assemble the result.
    async fn finish(
        &self,
        run: Run,
        outcome: std::result::Result<Finish, StageError>,
        start: Instant,
    ) -> ProcessingResult {
        let (status, success, skipped, error) = match outcome {
            Ok(Finish::Indexed) => (UrlStatus::Completed, true, false, None),
            Ok(Finish::Unchanged) => (UrlStatus::Skipped, true, true, None),
            Ok(Finish::Duplicate(err)) => (UrlStatus::Skipped, false, true, Some(err)),
            Err(err) => (UrlStatus::Failed, false, false, Some(err)),
        };

        if let Some(url_id) = &run.url_id {
            let message = error.as_ref().map(|e| e.message.as_str());
            if let Err(e) = self.urls.update_status(url_id, status, message).await {
                warn!(url = %run.url, %status, error = %e, "failed to record final status");
            }
        }

        self.tracker.record(match (success, skipped) {
            (_, true) => Outcome::Skipped,
            (true, false) => Outcome::Succeeded,
            (false, false) => Outcome::Failed,
        });

        if let Some(err) = &error {
            if !skipped {
                warn!(url = %run.url, code = %err.code, stage = %err.stage, "{}", err.message);
            }
        }

        ProcessingResult {
            error: error.map(|e| e.with_url(run.url.as_str())),
            url: run.url,
            success,
            skipped,
            entry_id: run.entry_id,
            url_id: run.url_id,
            content_type: run.content_type,
            metadata: run.metadata,
            stages: run.stages,
            tags: Vec::new(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    async fn link_tags(&self, url: &str, tag_names: &[String]) -> Result<()> {
        let tag_ids = self.tags.ensure_tags_exist(tag_names).await?;
        if tag_ids.is_empty() {
            return Ok(());
        }
        let url_id = self.urls.register(url, None).await?;
        self.urls.add_tags(&url_id, &tag_ids).await
    }

    async fn decorate_tags(&self, result: &mut ProcessingResult) {
        let url_id = match &result.url_id {
            Some(id) => id.clone(),
            None => match self.urls.get_url_info(&result.url).await {
                Ok(Some(record)) => record.id,
                _ => return,
            },
        };
        match self.urls.tags_for_url(&url_id).await {
            Ok(names) => result.tags = names,
            Err(e) => warn!(url = %result.url, error = %e, "tag lookup failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn effective_mime(fetched: &FetchedContent, classification: &Classification) -> String {
    if !fetched.mime_type.is_empty() {
        return fetched.mime_type.clone();
    }
    classification
        .mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// `text/html; charset=utf-8` → `text`
fn mime_category(mime_type: &str) -> Option<String> {
    mime_type
        .split(';')
        .next()
        .and_then(|essence| essence.split('/').next())
        .map(|category| category.trim().to_lowercase())
        .filter(|category| !category.is_empty())
}

fn file_extension(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "text/html" | "application/xhtml+xml" => "html",
        "text/markdown" => "md",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Lower-cased, deduplicated tag set: content type, domain, MIME category,
/// then requested tags.
fn entry_tags(content_type: &str, url: &str, mime_type: &str, requested: &[String]) -> Vec<String> {
    let derived = [
        Some(content_type.to_string()),
        Some(extract_domain(url)),
        mime_category(mime_type),
    ];

    let mut tags: Vec<String> = Vec::new();
    for tag in derived
        .into_iter()
        .flatten()
        .chain(requested.iter().cloned())
    {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

#[allow(clippy::too_many_arguments)]
fn build_entry(
    url: &str,
    url_id: &str,
    content_type: &str,
    mime_type: &str,
    hash: &str,
    fetched: &FetchedContent,
    processed: ProcessedContent,
    run_metadata: &ResultMetadata,
    requested_tags: &[String],
) -> KnowledgeEntry {
    let mut metadata = processed.metadata;
    metadata.insert("mime_type".into(), json!(mime_type));
    metadata.insert("operation_id".into(), json!(run_metadata.operation_id));
    if let Some(path) = &run_metadata.storage_path {
        metadata.insert("storage_path".into(), json!(path));
    }
    if let Some(scraper) = &run_metadata.scraper_used {
        metadata.insert("scraper_used".into(), json!(scraper));
    }
    if let Some(cleaning) = processed.cleaning_metadata {
        metadata.insert("cleaning".into(), cleaning);
    }
    if let Some(etag) = &fetched.metadata.etag {
        metadata.insert("etag".into(), json!(etag));
    }
    if let Some(last_modified) = &fetched.metadata.last_modified {
        metadata.insert("last_modified".into(), json!(last_modified));
    }

    let title = processed
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url_slug(url));
    let now = Utc::now();

    KnowledgeEntry {
        id: ids::entry_id(url),
        url_id: url_id.to_string(),
        url: url.to_string(),
        title,
        content_type: content_type.to_string(),
        content: processed.text,
        metadata,
        tags: entry_tags(content_type, url, mime_type, requested_tags),
        size: fetched.content.len() as u64,
        checksum: hash.to_string(),
        status: EntryStatus::Completed,
        created_at: now,
        updated_at: now,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
