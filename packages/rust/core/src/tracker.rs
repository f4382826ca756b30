//! In-memory bookkeeping of in-flight pipeline runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use kbingest_shared::Stage;
use serde::Serialize;

/// A pipeline run that has not finished yet.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentOperation {
    pub operation_id: String,
    pub url: String,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    /// 0..=100
    pub progress: u8,
}

/// Snapshot returned by [`Orchestrator::get_status`](crate::Orchestrator::get_status).
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub active: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub operations: Vec<CurrentOperation>,
}

/// How a run ended, for the cumulative counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Default)]
pub(crate) struct OperationTracker {
    operations: Mutex<HashMap<String, CurrentOperation>>,
    /// Normalized URLs with a run in progress.
    claimed: Mutex<HashSet<String>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl OperationTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CurrentOperation>> {
        self.operations.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a run; the returned guard removes it when dropped.
    pub(crate) fn begin(self: &Arc<Self>, operation_id: String, url: &str) -> OperationGuard {
        self.lock().insert(
            operation_id.clone(),
            CurrentOperation {
                operation_id: operation_id.clone(),
                url: url.to_string(),
                stage: Stage::Detecting,
                started_at: Utc::now(),
                progress: 0,
            },
        );
        OperationGuard {
            tracker: Arc::clone(self),
            operation_id,
        }
    }

    /// Reserve a normalized URL for one run. `None` while another run holds it.
    pub(crate) fn claim_url(self: &Arc<Self>, key: String) -> Option<UrlClaim> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        if !claimed.insert(key.clone()) {
            return None;
        }
        Some(UrlClaim {
            tracker: Arc::clone(self),
            key,
        })
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Failed => &self.failed,
            Outcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn status(&self) -> ProcessingStatus {
        let mut operations: Vec<CurrentOperation> = self.lock().values().cloned().collect();
        operations.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ProcessingStatus {
            active: operations.len(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            operations,
        }
    }
}

/// Keeps a [`CurrentOperation`] alive for the duration of one run.
pub(crate) struct OperationGuard {
    tracker: Arc<OperationTracker>,
    operation_id: String,
}

impl OperationGuard {
    pub(crate) fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub(crate) fn enter(&self, stage: Stage) {
        if let Some(op) = self.tracker.lock().get_mut(&self.operation_id) {
            op.stage = stage;
            op.progress = stage.progress();
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.operation_id);
    }
}

/// Exclusive hold on a URL; released on drop.
pub(crate) struct UrlClaim {
    tracker: Arc<OperationTracker>,
    key: String,
}

impl Drop for UrlClaim {
    fn drop(&mut self) {
        self.tracker
            .claimed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_and_removes_operation() {
        let tracker = Arc::new(OperationTracker::default());
        {
            let guard = tracker.begin("proc_1".into(), "https://a.com/");
            guard.enter(Stage::Fetching);

            let status = tracker.status();
            assert_eq!(status.active, 1);
            assert_eq!(status.operations[0].stage, Stage::Fetching);
            assert_eq!(status.operations[0].progress, 30);
        }
        assert_eq!(tracker.status().active, 0);
    }

    #[test]
    fn guard_removes_on_panic() {
        let tracker = Arc::new(OperationTracker::default());
        let t = Arc::clone(&tracker);
        let result = std::panic::catch_unwind(move || {
            let _guard = t.begin("proc_2".into(), "https://a.com/");
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(tracker.status().active, 0);
    }

    #[test]
    fn url_claim_is_exclusive_until_dropped() {
        let tracker = Arc::new(OperationTracker::default());
        let first = tracker.claim_url("https://a.com/x".into());
        assert!(first.is_some());
        assert!(tracker.claim_url("https://a.com/x".into()).is_none());
        assert!(tracker.claim_url("https://a.com/y".into()).is_some());

        drop(first);
        assert!(tracker.claim_url("https://a.com/x".into()).is_some());
    }

    #[test]
    fn counters_accumulate() {
        let tracker = OperationTracker::default();
        tracker.record(Outcome::Succeeded);
        tracker.record(Outcome::Succeeded);
        tracker.record(Outcome::Failed);
        tracker.record(Outcome::Skipped);

        let status = tracker.status();
        assert_eq!((status.succeeded, status.failed, status.skipped), (2, 1, 1));
    }
}
