//! indicatif-backed progress reporting for pipeline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use kbingest_core::{ProcessingResult, ProgressReporter};
use kbingest_shared::Stage;

/// Spinner showing the latest stage transition and a finished count.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
    total: usize,
    finished: AtomicUsize,
}

impl CliProgress {
    /// `quiet` hides the spinner entirely (e.g. for `--json` output).
    pub(crate) fn new(total: usize, quiet: bool) -> Self {
        let spinner = if quiet {
            ProgressBar::hidden()
        } else {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        };
        Self {
            spinner,
            total,
            finished: AtomicUsize::new(0),
        }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, url: &str, stage: Stage) {
        let done = self.finished.load(Ordering::Relaxed);
        self.spinner.set_message(format!(
            "[{done}/{}] {:<10} {url}",
            self.total,
            stage.as_str().to_lowercase()
        ));
    }

    fn finished(&self, result: &ProcessingResult) {
        let done = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        self.spinner
            .set_message(format!("[{done}/{}] done {}", self.total, result.url));
    }
}
