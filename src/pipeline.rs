//! Worker fan-out, error aggregation and progress reporting shared by both directions.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::patch_format::{PatchInfo, Summary};

/// Progress snapshot handed to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionState {
    pub label: String,
    pub indeterminate: bool,
    pub current: u64,
    pub max: u64,
}

pub type ProgressFn = Arc<dyn Fn(MissionState) + Send + Sync>;

/// Optional progress observer. Cloning shares the same callback.
#[derive(Clone, Default)]
pub struct Progress(Option<ProgressFn>);

impl Progress {
    pub fn new(callback: ProgressFn) -> Self {
        Self(Some(callback))
    }

    pub fn busy(&self, label: impl Into<String>) {
        self.emit(MissionState {
            label: label.into(),
            indeterminate: true,
            current: 0,
            max: 0,
        });
    }

    pub fn step(&self, label: impl Into<String>, current: u64, max: u64) {
        self.emit(MissionState {
            label: label.into(),
            indeterminate: false,
            current,
            max,
        });
    }

    fn emit(&self, state: MissionState) {
        if let Some(callback) = &self.0 {
            callback(state);
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Progress").field(&self.0.is_some()).finish()
    }
}

/// Ordered, lock-guarded list of failure messages shared by every worker of one run.
#[derive(Debug, Clone, Default)]
pub struct ErrorList(Arc<Mutex<Vec<String>>>);

impl ErrorList {
    pub fn push(&self, message: impl Into<String>) {
        self.lock().push(message.into());
    }

    /// Record an error with its whole context chain.
    pub fn record(&self, err: &anyhow::Error) {
        tracing::debug!("worker error: {err:#}");
        self.push(format!("{err:#}"));
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // A worker that panicked while pushing still leaves a usable list.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A set of blocking workers the coordinator can join directly.
///
/// Every worker gets the group's cancellation token. Failures are recorded in the
/// shared [`ErrorList`]; with `cancel_on_error` the first one also cancels the token.
pub struct TaskGroup {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    errors: ErrorList,
    cancel_on_error: bool,
}

impl TaskGroup {
    /// A group whose first failure cancels the remaining workers.
    pub fn new(errors: ErrorList) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            errors,
            cancel_on_error: true,
        }
    }

    /// A group whose workers always run to completion.
    pub fn without_cancellation(errors: ErrorList) -> Self {
        Self {
            cancel_on_error: false,
            ..Self::new(errors)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask workers that have not reached their next checkpoint to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn spawn<F>(&mut self, work: F)
    where
        F: FnOnce(&CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        let token = self.cancel.clone();
        let errors = self.errors.clone();
        let cancel_on_error = self.cancel_on_error;
        self.tasks.spawn_blocking(move || {
            if let Err(err) = work(&token) {
                errors.record(&err);
                if cancel_on_error {
                    token.cancel();
                }
            }
        });
    }

    /// Join every worker, including those still running after a failure.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                self.errors.push(format!("worker failed: {err}"));
                if self.cancel_on_error {
                    self.cancel.cancel();
                }
            }
        }
    }
}

/// Outcome of one pipeline run. Failures are carried here rather than returned as `Err`.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub info: Option<PatchInfo>,
    errors: Vec<String>,
}

impl Report {
    pub fn new(info: Option<PatchInfo>, errors: Vec<String>) -> Self {
        Self { info, errors }
    }

    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn summary(&self) -> Summary {
        self.info.as_ref().map(PatchInfo::summary).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_errors_are_aggregated() {
        let errors = ErrorList::default();
        let done = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::without_cancellation(errors.clone());
        for i in 0..5 {
            let done = done.clone();
            group.spawn(move |_| {
                if i % 2 == 1 {
                    anyhow::bail!("worker {i} failed");
                }
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        group.wait().await;

        let mut messages = errors.snapshot();
        messages.sort();
        assert_eq!(messages, vec!["worker 1 failed", "worker 3 failed"]);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(!group.is_cancelled());
    }

    #[tokio::test]
    async fn test_first_error_cancels_group() {
        let errors = ErrorList::default();
        let observed = Arc::new(AtomicBool::new(false));
        let mut group = TaskGroup::new(errors.clone());

        let seen = observed.clone();
        group.spawn(move |token| {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !token.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            seen.store(token.is_cancelled(), Ordering::SeqCst);
            Ok(())
        });
        group.spawn(|_| Err(anyhow::anyhow!("disk full")));
        group.wait().await;

        assert!(group.is_cancelled());
        assert!(observed.load(Ordering::SeqCst), "running worker must see the cancellation");
        assert_eq!(errors.snapshot(), vec!["disk full"]);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_recorded() {
        let errors = ErrorList::default();
        let mut group = TaskGroup::without_cancellation(errors.clone());
        group.spawn(|_| panic!("boom"));
        group.wait().await;
        assert_eq!(errors.len(), 1);
        assert!(errors.snapshot()[0].starts_with("worker failed"));
    }

    #[test]
    fn test_context_chain_is_kept() {
        let errors = ErrorList::default();
        let err = anyhow::anyhow!("permission denied").context("Failed to write a.txt");
        errors.record(&err);
        assert_eq!(errors.snapshot(), vec!["Failed to write a.txt: permission denied"]);
    }

    #[test]
    fn test_progress_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(Arc::new(move |state: MissionState| sink.lock().unwrap().push(state)));
        progress.busy("Verifying");
        progress.step("Copying", 5, 10);
        Progress::default().busy("ignored");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].indeterminate);
        assert_eq!((seen[1].current, seen[1].max), (5, 10));
    }

    #[test]
    fn test_report_flags() {
        assert!(!Report::default().has_error());
        let report = Report::new(None, vec!["bad".into()]);
        assert!(report.has_error());
        assert_eq!(report.errors(), &["bad".to_string()]);
        assert_eq!(report.summary(), Summary::default());
    }
}
