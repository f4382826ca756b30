//! Ingestion orchestration for kbingest.
//!
//! [`Orchestrator`] drives each URL through detection, fetching, processing,
//! storing and indexing, using the collaborator traits from
//! `kbingest-shared`. This crate also provides the default
//! [`ChangeDetector`](kbingest_shared::ChangeDetector) over the URL repository
//! and a local-disk [`FileStorage`](kbingest_shared::FileStorage).

pub mod change;
pub mod files;
pub mod ids;
pub mod pipeline;
pub mod progress;
mod tracker;

pub use change::RepositoryChangeDetector;
pub use files::LocalFileStorage;
pub use pipeline::{
    Collaborators, IngestOptions, Orchestrator, ProcessingResult, ResultMetadata, TagQuery,
};
pub use progress::{ProgressReporter, SilentProgress};
pub use tracker::{CurrentOperation, ProcessingStatus};
