//! Structured error/warning collection keyed by context (usually a URL).
//!
//! Issues are kept in memory only; the fetcher exports a context's summary
//! into the fetch metadata and then clears it.

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use kbingest_shared::Metadata;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Critical,
    Error,
    Recoverable,
}

impl ErrorSeverity {
    /// Severity implied by an error message.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("fatal") || msg.contains("critical") || msg.contains("invalid configuration")
        {
            ErrorSeverity::Critical
        } else if msg.contains("timeout") || msg.contains("network") || msg.contains("retry") {
            ErrorSeverity::Recoverable
        } else {
            ErrorSeverity::Error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Warning,
    Info,
}

impl WarningSeverity {
    /// Severity implied by a warning message.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("deprecated") || msg.contains("slow") || msg.contains("limit") {
            WarningSeverity::Warning
        } else if msg.contains("cache") {
            WarningSeverity::Info
        } else {
            WarningSeverity::Warning
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: WarningSeverity,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub total_errors: usize,
    pub total_warnings: usize,
    pub critical_errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Everything recorded for one context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapingIssues {
    pub errors: Vec<ErrorEntry>,
    pub warnings: Vec<WarningEntry>,
    pub summary: IssueSummary,
}

#[derive(Debug, Clone, Default)]
struct ContextIssues {
    errors: Vec<ErrorEntry>,
    warnings: Vec<WarningEntry>,
}

impl ContextIssues {
    fn summary(&self) -> IssueSummary {
        IssueSummary {
            total_errors: self.errors.len(),
            total_warnings: self.warnings.len(),
            critical_errors: self
                .errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Critical)
                .count(),
            first_error_at: self.errors.iter().map(|e| e.timestamp).min(),
            last_error_at: self.errors.iter().map(|e| e.timestamp).max(),
        }
    }

    fn snapshot(&self) -> ScrapingIssues {
        ScrapingIssues {
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            summary: self.summary(),
        }
    }
}

/// Thread-safe collector of per-context errors and warnings.
#[derive(Debug, Default)]
pub struct IssueCollector {
    contexts: Mutex<HashMap<String, ContextIssues>>,
}

impl IssueCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error; severity is derived from the message.
    pub fn record_error(&self, context: &str, message: &str, metadata: Option<Metadata>) {
        self.push_error(context, message.to_string(), None, None, metadata);
    }

    /// Record an error value. Its `source()` chain becomes the stack.
    pub fn record_error_from(
        &self,
        context: &str,
        err: &(dyn StdError + 'static),
        code: Option<&str>,
        metadata: Option<Metadata>,
    ) {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        let stack = if chain.is_empty() {
            None
        } else {
            Some(chain.join("\ncaused by: "))
        };
        self.push_error(
            context,
            err.to_string(),
            stack,
            code.map(str::to_string),
            metadata,
        );
    }

    /// Record a warning; severity is derived from the message.
    pub fn record_warning(&self, context: &str, message: &str, metadata: Option<Metadata>) {
        let severity = WarningSeverity::classify(message);
        match severity {
            WarningSeverity::Warning => warn!(context, severity = ?severity, "{message}"),
            WarningSeverity::Info => info!(context, severity = ?severity, "{message}"),
        }

        let entry = WarningEntry {
            timestamp: Utc::now(),
            message: message.to_string(),
            severity,
            metadata: metadata.unwrap_or_default(),
        };
        self.lock()
            .entry(context.to_string())
            .or_default()
            .warnings
            .push(entry);
    }

    pub fn get_errors(&self, context: &str) -> Vec<ErrorEntry> {
        self.lock()
            .get(context)
            .map(|c| c.errors.clone())
            .unwrap_or_default()
    }

    pub fn get_warnings(&self, context: &str) -> Vec<WarningEntry> {
        self.lock()
            .get(context)
            .map(|c| c.warnings.clone())
            .unwrap_or_default()
    }

    /// Errors, warnings and summary for a context. Unknown contexts yield an
    /// empty report.
    pub fn get_issues(&self, context: &str) -> ScrapingIssues {
        self.lock()
            .get(context)
            .map(ContextIssues::snapshot)
            .unwrap_or_default()
    }

    /// Drop one context, or everything.
    pub fn clear_issues(&self, context: Option<&str>) {
        let mut contexts = self.lock();
        match context {
            Some(context) => {
                contexts.remove(context);
            }
            None => contexts.clear(),
        }
    }

    /// All contexts, ordered by key.
    pub fn export_issues(&self) -> BTreeMap<String, ScrapingIssues> {
        self.lock()
            .iter()
            .map(|(context, issues)| (context.clone(), issues.snapshot()))
            .collect()
    }

    /// Append everything from `other` into this collector.
    pub fn merge(&self, other: &IssueCollector) {
        let incoming = other.export_issues();
        let mut contexts = self.lock();
        for (context, issues) in incoming {
            let target = contexts.entry(context).or_default();
            target.errors.extend(issues.errors);
            target.warnings.extend(issues.warnings);
        }
    }

    pub fn has_critical(&self, context: &str) -> bool {
        self.lock().get(context).is_some_and(|c| {
            c.errors
                .iter()
                .any(|e| e.severity == ErrorSeverity::Critical)
        })
    }

    fn push_error(
        &self,
        context: &str,
        message: String,
        stack: Option<String>,
        code: Option<String>,
        metadata: Option<Metadata>,
    ) {
        let severity = ErrorSeverity::classify(&message);
        match severity {
            ErrorSeverity::Recoverable => warn!(context, severity = ?severity, "{message}"),
            _ => error!(context, severity = ?severity, "{message}"),
        }

        let entry = ErrorEntry {
            timestamp: Utc::now(),
            message,
            stack,
            code,
            severity,
            metadata: metadata.unwrap_or_default(),
        };
        self.lock()
            .entry(context.to_string())
            .or_default()
            .errors
            .push(entry);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContextIssues>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("fetch failed")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn error_severity_from_message() {
        assert_eq!(
            ErrorSeverity::classify("Fatal: parser crashed"),
            ErrorSeverity::Critical
        );
        assert_eq!(
            ErrorSeverity::classify("invalid configuration for scraper"),
            ErrorSeverity::Critical
        );
        assert_eq!(
            ErrorSeverity::classify("Network unreachable"),
            ErrorSeverity::Recoverable
        );
        assert_eq!(
            ErrorSeverity::classify("request TIMEOUT"),
            ErrorSeverity::Recoverable
        );
        assert_eq!(ErrorSeverity::classify("bad selector"), ErrorSeverity::Error);
    }

    #[test]
    fn warning_severity_from_message() {
        assert_eq!(
            WarningSeverity::classify("Deprecated option"),
            WarningSeverity::Warning
        );
        assert_eq!(
            WarningSeverity::classify("slow response (6000 ms)"),
            WarningSeverity::Warning
        );
        assert_eq!(
            WarningSeverity::classify("served from cache"),
            WarningSeverity::Info
        );
        assert_eq!(
            WarningSeverity::classify("something odd"),
            WarningSeverity::Warning
        );
    }

    #[test]
    fn summary_counts_per_context() {
        let collector = IssueCollector::new();
        collector.record_error("a", "critical failure", None);
        collector.record_error("a", "network blip", None);
        collector.record_warning("a", "cache miss", None);
        collector.record_error("b", "oops", None);

        let issues = collector.get_issues("a");
        assert_eq!(issues.summary.total_errors, 2);
        assert_eq!(issues.summary.total_warnings, 1);
        assert_eq!(issues.summary.critical_errors, 1);
        assert!(issues.summary.first_error_at <= issues.summary.last_error_at);
        assert!(collector.has_critical("a"));
        assert!(!collector.has_critical("b"));
        assert_eq!(collector.get_warnings("a")[0].severity, WarningSeverity::Info);

        collector.clear_issues(Some("a"));
        assert!(collector.get_errors("a").is_empty());
        assert_eq!(collector.get_errors("b").len(), 1);
        collector.clear_issues(None);
        assert!(collector.export_issues().is_empty());
    }

    #[test]
    fn error_chain_becomes_stack() {
        let collector = IssueCollector::new();
        let err = Outer {
            inner: std::io::Error::other("connection reset"),
        };
        collector.record_error_from("ctx", &err, Some("E_FETCH"), None);

        let errors = collector.get_errors("ctx");
        assert_eq!(errors[0].message, "fetch failed");
        assert_eq!(errors[0].code.as_deref(), Some("E_FETCH"));
        assert!(errors[0].stack.as_deref().unwrap().contains("connection reset"));
    }

    #[test]
    fn merge_is_additive() {
        let a = IssueCollector::new();
        let b = IssueCollector::new();
        a.record_error("x", "one", None);
        b.record_error("x", "two", None);
        b.record_warning("y", "slow", None);

        a.merge(&b);
        assert_eq!(a.get_errors("x").len(), 2);
        assert_eq!(a.get_warnings("y").len(), 1);
        assert_eq!(b.get_errors("x").len(), 1);
    }
}
