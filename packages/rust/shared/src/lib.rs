//! Shared types, error model, and configuration for kbingest.
//!
//! This crate is the foundation depended on by all other kbingest crates.
//! It provides:
//! - [`IngestError`] and the pipeline taxonomy ([`ErrorCode`], [`Stage`], [`StageError`])
//! - Domain types ([`UrlRecord`], [`Tag`], [`KnowledgeEntry`])
//! - Configuration ([`AppConfig`] and the runtime configs derived from it)
//! - URL normalization and content hashing
//! - The collaborator traits the pipeline is wired from

pub mod collaborators;
pub mod config;
pub mod error;
pub mod hash;
pub mod types;
pub mod urls;

// Re-export public API at crate root for ergonomic imports.
pub use collaborators::{
    ChangeCheck, ChangeDetector, Classification, Classifier, FetchMetadata, FetchOptions,
    FetchedContent, Fetcher, FileStorage, FileStoreOptions, KnowledgeStore, OriginalFileInfo,
    OriginalFileTracker, ProcessOptions, ProcessedContent, Processor,
};
pub use config::{
    AppConfig, DEFAULT_CONCURRENCY, DefaultsConfig, FetchConfig, FetchSection, ParamsSection,
    PipelineConfig, RateLimitConfig, RateLimitSection, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from,
};
pub use error::{ErrorCode, IngestError, Result, Stage, StageError};
pub use hash::{content_hash, string_hash32};
pub use types::{
    EntryStatus, KnowledgeEntry, Metadata, NewTag, Tag, TagFilter, TagUpdate, UrlFilter,
    UrlRecord, UrlStatus, merge_metadata,
};
pub use urls::{extract_domain, normalize_url, url_slug};
