//! Network-facing collaborators for kbingest.
//!
//! - [`RateLimiter`] — per-domain request spacing
//! - [`IssueCollector`] — per-URL errors and warnings
//! - [`HttpFetcher`] — reqwest-based [`Fetcher`](kbingest_shared::Fetcher)
//! - [`UrlClassifier`] — extension-based [`Classifier`](kbingest_shared::Classifier)

pub mod classify;
pub mod http;
pub mod issues;
pub mod rate_limit;

pub use classify::UrlClassifier;
pub use http::HttpFetcher;
pub use issues::{
    ErrorEntry, ErrorSeverity, IssueCollector, IssueSummary, ScrapingIssues, WarningEntry,
    WarningSeverity,
};
pub use rate_limit::{RateLimitInfo, RateLimiter};
