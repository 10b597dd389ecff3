//! Teardown handles owned by an extension and the coordinator that runs them.

use std::{
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Result;
use futures_util::future::{join_all, BoxFuture, FutureExt};

pub const UNLOAD_TIMEOUT_MS_DEFAULT: u64 = 5_000;

type UnloadFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type LivenessFn = Box<dyn Fn() -> bool + Send + Sync>;

/// One reversible registration made by an extension.
pub struct Unload {
    name: String,
    source: Option<String>,
    run: UnloadFn,
    live: Option<LivenessFn>,
}

impl Unload {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            source: None,
            run: Box::new(move || run().boxed()),
            live: None,
        }
    }

    /// Wraps a synchronous teardown.
    pub fn from_fn<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(name, move || async move {
            run();
            Ok(())
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Lets the owning set drop this handle once `live` reports the
    /// registration is already gone.
    pub fn with_liveness<F>(mut self, live: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.live = Some(Box::new(live));
        self
    }

    pub fn is_live(&self) -> bool {
        self.live.as_ref().map_or(true, |live| live())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// `source.name`, or just the name when no source was attached.
    pub fn label(&self) -> String {
        match &self.source {
            Some(source) => format!("{source}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub async fn run(self) -> Result<()> {
        (self.run)().await
    }
}

impl fmt::Debug for Unload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unload")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl UnloadReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.timed_out
    }

    fn record(&mut self, status: UnloadStatus) {
        match status {
            UnloadStatus::Completed => self.completed += 1,
            UnloadStatus::Failed => self.failed += 1,
            UnloadStatus::TimedOut => self.timed_out += 1,
        }
    }
}

/// Set of unload handles belonging to one extension.
#[derive(Debug)]
pub struct UnloadSet {
    handles: Mutex<Vec<Unload>>,
    timeout: Duration,
}

impl Default for UnloadSet {
    fn default() -> Self {
        Self::with_timeout(Duration::from_millis(UNLOAD_TIMEOUT_MS_DEFAULT))
    }
}

impl UnloadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            timeout,
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<Unload>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `unload`, first dropping handles whose registration is gone.
    pub fn add(&self, unload: Unload) {
        let mut handles = self.handles();
        handles.retain(Unload::is_live);
        handles.push(unload);
    }

    /// Drops handles whose registration is gone. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut handles = self.handles();
        let before = handles.len();
        handles.retain(Unload::is_live);
        before - handles.len()
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    /// Runs every handle concurrently, each bounded by the set's timeout.
    ///
    /// The set is emptied before any handle starts, so handles registered
    /// while unloading survive for the next call. A handle that overruns its
    /// timeout keeps running detached; it is only no longer waited on.
    pub async fn unload_all(&self) -> UnloadReport {
        let handles = std::mem::take(&mut *self.handles());
        let mut report = UnloadReport::default();
        if handles.is_empty() {
            return report;
        }

        let timeout = self.timeout;
        let runs = handles
            .into_iter()
            .map(|unload| run_with_timeout(unload, timeout));
        for status in join_all(runs).await {
            report.record(status);
        }
        tracing::debug!(
            completed = report.completed,
            failed = report.failed,
            timed_out = report.timed_out,
            "unload set drained"
        );
        report
    }
}

async fn run_with_timeout(unload: Unload, timeout: Duration) -> UnloadStatus {
    let label = unload.label();
    let task = tokio::spawn(unload.run());
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(()))) => UnloadStatus::Completed,
        Ok(Ok(Err(error))) => {
            tracing::error!(unload = %label, error = %format!("{error:#}"), "error unloading");
            UnloadStatus::Failed
        }
        Ok(Err(join_error)) => {
            tracing::error!(unload = %label, error = %join_error, "unload task aborted");
            UnloadStatus::Failed
        }
        Err(_) => {
            tracing::error!(
                unload = %label,
                timeout_ms = timeout.as_millis() as u64,
                "unload took longer than its timeout to run"
            );
            UnloadStatus::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use anyhow::anyhow;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn functional_unload_all_bounds_a_hanging_handle_by_timeout() {
        let set = UnloadSet::new();
        let finished = Arc::new(AtomicUsize::new(0));
        for name in ["first", "second"] {
            let finished = Arc::clone(&finished);
            set.add(
                Unload::from_fn(name, move || {
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .with_source("plugin-a"),
            );
        }
        set.add(Unload::new("hang", || std::future::pending::<Result<()>>()).with_source("plugin-a"));

        let started = tokio::time::Instant::now();
        let report = set.unload_all().await;
        let elapsed = started.elapsed();

        assert_eq!(report.completed, 2);
        assert_eq!(report.timed_out, 1);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_millis(UNLOAD_TIMEOUT_MS_DEFAULT));
        assert!(elapsed < Duration::from_millis(UNLOAD_TIMEOUT_MS_DEFAULT * 2));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn regression_set_is_cleared_before_any_handle_runs() {
        let set = Arc::new(UnloadSet::new());
        let observed_len = Arc::new(AtomicUsize::new(usize::MAX));
        for name in ["a", "b", "c"] {
            let inner = Arc::clone(&set);
            let observed_len = Arc::clone(&observed_len);
            set.add(Unload::from_fn(name, move || {
                observed_len.fetch_min(inner.len(), Ordering::SeqCst);
            }));
        }

        let report = set.unload_all().await;
        assert_eq!(report.total(), 3);
        assert_eq!(observed_len.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn regression_handle_registered_during_unload_is_kept_for_next_pass() {
        let set = Arc::new(UnloadSet::new());
        let reentrant = Arc::clone(&set);
        set.add(Unload::from_fn("re-register", move || {
            reentrant.add(Unload::from_fn("late", || {}));
        }));

        let first = set.unload_all().await;
        assert_eq!(first.completed, 1);
        assert_eq!(set.len(), 1);

        let second = set.unload_all().await;
        assert_eq!(second.completed, 1);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn unit_failing_and_panicking_handles_do_not_fail_the_others() {
        let set = UnloadSet::new();
        set.add(Unload::new("fails", || async { Err(anyhow!("teardown failed")) }));
        set.add(Unload::from_fn("panics", || panic!("teardown panicked")));
        set.add(Unload::from_fn("ok", || {}));

        let report = set.unload_all().await;
        assert_eq!(
            report,
            UnloadReport {
                completed: 1,
                failed: 2,
                timed_out: 0,
            }
        );
    }

    #[test]
    fn unit_add_drops_handles_that_are_no_longer_live() {
        let set = UnloadSet::new();
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        set.add(Unload::from_fn("watched", || {}).with_liveness(move || flag.load(Ordering::SeqCst)));
        set.add(Unload::from_fn("plain", || {}));
        assert_eq!(set.len(), 2);

        alive.store(false, Ordering::SeqCst);
        set.add(Unload::from_fn("next", || {}));
        assert_eq!(set.len(), 2);
        assert_eq!(set.prune(), 0);
    }

    #[tokio::test]
    async fn unit_unload_all_on_empty_set_is_a_no_op() {
        let report = UnloadSet::new().unload_all().await;
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn unit_label_joins_source_and_name() {
        let unload = Unload::from_fn("intercept", || {}).with_source("lyrics");
        assert_eq!(unload.label(), "lyrics.intercept");
        assert_eq!(Unload::from_fn("bare", || {}).label(), "bare");
    }
}
