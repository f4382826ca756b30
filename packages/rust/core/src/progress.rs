//! Progress observation for pipeline runs.

use kbingest_shared::Stage;

use crate::pipeline::ProcessingResult;

/// Receives stage transitions and finished results.
///
/// Called from concurrent runs; implementations must be cheap and must not
/// block.
pub trait ProgressReporter: Send + Sync {
    /// A run for `url` entered `stage`.
    fn stage(&self, url: &str, stage: Stage);
    /// A run finished (success, skip or failure).
    fn finished(&self, result: &ProcessingResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage(&self, _url: &str, _stage: Stage) {}
    fn finished(&self, _result: &ProcessingResult) {}
}
