//! Fixed-size work-stealing worker pool.
//!
//! Tasks start in a global injector. Each worker keeps a local FIFO deque,
//! refills it in batches from the injector, and steals from siblings when
//! both are empty. Failing tasks are retried in place with exponential
//! backoff while other workers carry on. Every task produces exactly one
//! [`TaskReport`], delivered over a channel to the calling thread, which is
//! the single writer of job-level state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::utils::Backoff;
use tracing::{debug, trace, warn};

use crate::chunk::TransferTask;
use crate::error::{Result, SyncError};

/// Longest single sleep while waiting out a backoff; keeps cancellation
/// responsive.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared by a job and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancelled.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] after [`cancel`](Self::cancel).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retrying a task whose attempt `attempt` just failed:
    /// `base * 2^attempt`, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `error` on `attempt`.
    #[must_use]
    pub fn should_retry(&self, error: &SyncError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Final result of one task.
#[derive(Debug)]
pub struct TaskReport<T> {
    /// The task as last attempted.
    pub task: TransferTask,
    /// Outcome of the last attempt.
    pub result: Result<T>,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    threads: usize,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl WorkerPool {
    /// Pool of `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize, retry: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            threads: threads.max(1),
            retry,
            cancel,
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` over `tasks` and feed every report to `collect` on the
    /// calling thread. Tasks are dequeued in the order given.
    ///
    /// Returns once every task has reported. After cancellation, tasks that
    /// never started report [`SyncError::Cancelled`]; a task already running
    /// finishes its current attempt first.
    pub fn run<T, F, C>(&self, tasks: Vec<TransferTask>, work: F, mut collect: C)
    where
        T: Send,
        F: Fn(&TransferTask) -> Result<T> + Sync,
        C: FnMut(TaskReport<T>),
    {
        if tasks.is_empty() {
            return;
        }
        let injector = Injector::new();
        let outstanding = AtomicUsize::new(tasks.len());
        debug!(tasks = tasks.len(), threads = self.threads, "pool starting");
        for task in tasks {
            injector.push(task);
        }

        let locals: Vec<Worker<TransferTask>> = (0..self.threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<TransferTask>> = locals.iter().map(Worker::stealer).collect();
        let (tx, rx) = channel::unbounded();

        std::thread::scope(|scope| {
            for (id, local) in locals.into_iter().enumerate() {
                let tx = tx.clone();
                let ctx = WorkerContext {
                    id,
                    injector: &injector,
                    stealers: &stealers,
                    outstanding: &outstanding,
                    retry: self.retry,
                    cancel: &self.cancel,
                };
                let work = &work;
                scope.spawn(move || ctx.run(&local, work, &tx));
            }
            drop(tx);
            for report in rx {
                collect(report);
            }
        });

        loop {
            match injector.steal() {
                Steal::Success(task) => collect(TaskReport {
                    task,
                    result: Err(SyncError::Cancelled),
                }),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        debug!("pool finished");
    }
}

struct WorkerContext<'a> {
    id: usize,
    injector: &'a Injector<TransferTask>,
    stealers: &'a [Stealer<TransferTask>],
    outstanding: &'a AtomicUsize,
    retry: RetryPolicy,
    cancel: &'a CancelToken,
}

impl WorkerContext<'_> {
    fn run<T, F>(&self, local: &Worker<TransferTask>, work: &F, tx: &channel::Sender<TaskReport<T>>)
    where
        F: Fn(&TransferTask) -> Result<T>,
    {
        let backoff = Backoff::new();
        while self.outstanding.load(Ordering::Acquire) > 0 {
            if self.cancel.is_cancelled() {
                while let Some(task) = local.pop() {
                    self.finish(tx, task, Err(SyncError::Cancelled));
                }
                break;
            }
            let Some(task) = self.find_task(local) else {
                if backoff.is_completed() {
                    std::thread::sleep(Duration::from_millis(1));
                } else {
                    backoff.snooze();
                }
                continue;
            };
            backoff.reset();
            let (task, result) = self.attempt(task, work);
            self.finish(tx, task, result);
        }
        trace!(worker = self.id, "worker exiting");
    }

    fn find_task(&self, local: &Worker<TransferTask>) -> Option<TransferTask> {
        local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|s| !s.is_retry())
            .and_then(Steal::success)
        })
    }

    fn attempt<T, F>(&self, mut task: TransferTask, work: &F) -> (TransferTask, Result<T>)
    where
        F: Fn(&TransferTask) -> Result<T>,
    {
        loop {
            match work(&task) {
                Err(e) if self.retry.should_retry(&e, task.attempt) => {
                    let delay = self.retry.delay(task.attempt);
                    warn!(
                        worker = self.id,
                        file = task.file,
                        attempt = task.attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "task failed, retrying"
                    );
                    if self.sleep(delay).is_err() {
                        return (task, Err(SyncError::Cancelled));
                    }
                    task = task.retry();
                }
                result => return (task, result),
            }
        }
    }

    fn sleep(&self, delay: Duration) -> Result<()> {
        let mut left = delay;
        while !left.is_zero() {
            self.cancel.check()?;
            let step = left.min(CANCEL_POLL);
            std::thread::sleep(step);
            left -= step;
        }
        self.cancel.check()
    }

    fn finish<T>(&self, tx: &channel::Sender<TaskReport<T>>, task: TransferTask, result: Result<T>) {
        // A send only fails once the collector is gone, which cannot happen
        // while workers are alive inside the scope.
        let _ = tx.send(TaskReport { task, result });
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
