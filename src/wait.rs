//! Generic resource wait engine
//!
//! Everything long-running in the lifecycle flows funnels through this
//! module: a poll-until-ready primitive plus two composition patterns built
//! on top of it.
//!
//! - [`wait_until`]: poll a probe at a fixed interval until it reports ready
//!   or the timeout elapses. The probe's own errors are non-retryable.
//! - [`wait_all_settled`]: unbounded fan-out over independent targets. Every
//!   task runs to completion even after the first failure is observed, so a
//!   slow provider is never starved by an early failure elsewhere; the first
//!   error wins, the rest are logged.
//! - [`wait_two_phase`]: a gating subset awaited sequentially, then a
//!   parallel subset on a bounded pool with a cancellation flag. The flag is
//!   only checked before a task starts; in-flight polls run to their own
//!   timeout. That cost is bounded by each task's timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Default poll interval between probe attempts
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default overall wait timeout
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounds for a single polled wait
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Delay between probe attempts
    pub interval: Duration,
    /// Overall deadline for the wait
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollOptions {
    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What a readiness probe observed on one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The target is ready; the wait ends successfully
    Ready,
    /// The target is not ready yet, with a human-readable reason; retried
    NotReady(String),
}

/// Poll `probe` until it reports ready or `options.timeout` elapses
///
/// The first probe runs immediately. A probe error is treated as
/// non-retryable and returned as-is; on timeout the returned error names the
/// operation and carries the last observed not-ready reason.
pub async fn wait_until<F, Fut>(options: PollOptions, operation: &str, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WaitOutcome>>,
{
    let start = tokio::time::Instant::now();
    let mut last_reason = String::from("not yet observed");

    loop {
        match probe().await {
            Ok(WaitOutcome::Ready) => return Ok(()),
            Ok(WaitOutcome::NotReady(reason)) => {
                debug!(operation, reason = %reason, "target not ready, will retry");
                last_reason = reason;
            }
            Err(err) => return Err(err),
        }

        if start.elapsed() + options.interval > options.timeout {
            return Err(Error::timeout(operation, options.timeout, last_reason));
        }
        tokio::time::sleep(options.interval).await;
    }
}

/// A named wait target for the composition patterns
pub struct WaitTask {
    /// Name used in logs and error reports
    pub name: String,
    future: BoxFuture<'static, Result<()>>,
}

impl WaitTask {
    /// Wrap a future as a named wait target
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

/// Fan-out-join over independent wait targets
///
/// Spawns one task per target and collects results on a channel sized to the
/// target count. No early cancellation: every target runs to its own
/// completion. Returns the first error received; later errors are logged.
pub async fn wait_all_settled(tasks: Vec<WaitTask>) -> Result<()> {
    let total = tasks.len();
    if total == 0 {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel(total);
    for task in tasks {
        let tx = tx.clone();
        let WaitTask { name, future } = task;
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send((name, result)).await;
        });
    }
    drop(tx);

    let mut first_error = None;
    while let Some((name, result)) = rx.recv().await {
        match result {
            Ok(()) => debug!(target = %name, "wait target ready"),
            Err(err) => {
                warn!(target = %name, error = %err, "wait target failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Pool bounds for the parallel phase of [`wait_two_phase`]
#[derive(Debug, Clone, Copy)]
pub struct TwoPhaseOptions {
    /// Maximum number of parallel-phase tasks in flight at once
    pub max_parallel: usize,
}

impl Default for TwoPhaseOptions {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

/// Two-phase barrier: sequential gating waits, then bounded parallel waits
///
/// The gating targets are awaited in order and the first failure aborts the
/// whole barrier before any parallel target starts. Parallel targets share a
/// cancellation flag set on first failure; the flag is consulted only before
/// a task begins, so targets already polling run to their own timeout.
pub async fn wait_two_phase(
    gating: Vec<WaitTask>,
    parallel: Vec<WaitTask>,
    options: TwoPhaseOptions,
) -> Result<()> {
    for task in gating {
        let name = task.name.clone();
        task.future.await?;
        debug!(target = %name, "gating wait target ready");
    }

    let total = parallel.len();
    if total == 0 {
        return Ok(());
    }

    let cancelled = Arc::new(AtomicBool::new(false));
    let pool = Arc::new(Semaphore::new(options.max_parallel.max(1)));
    let (tx, mut rx) = mpsc::channel(total);

    for task in parallel {
        let tx = tx.clone();
        let cancelled = Arc::clone(&cancelled);
        let pool = Arc::clone(&pool);
        let WaitTask { name, future } = task;
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if cancelled.load(Ordering::SeqCst) {
                let _ = tx.send((name, None)).await;
                return;
            }
            let result = future.await;
            if result.is_err() {
                cancelled.store(true, Ordering::SeqCst);
            }
            let _ = tx.send((name, Some(result))).await;
        });
    }
    drop(tx);

    let mut first_error = None;
    let mut skipped = 0usize;
    while let Some((name, outcome)) = rx.recv().await {
        match outcome {
            None => {
                skipped += 1;
                debug!(target = %name, "wait target skipped after earlier failure");
            }
            Some(Ok(())) => debug!(target = %name, "wait target ready"),
            Some(Err(err)) => {
                warn!(target = %name, error = %err, "wait target failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    if skipped > 0 {
        info!(skipped, "parallel wait targets never started");
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
