//! Delayed task execution.
//!
//! The channel core never sleeps or spawns on its own; it hands
//! `(delay, task)` pairs to a `Scheduler`. A task runs at most once, and not
//! at all if its `TimerHandle` is cancelled first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<Arc<AbortHandle>>,
}

impl TimerHandle {
    /// Stop the task from running if it has not started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Executor for delayed and event-triggered tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run `task` once when `signal` fires. Dropped signals never run it.
    fn on_signal(&self, signal: oneshot::Receiver<()>, task: Task);
}

/// `Scheduler` backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });
        TimerHandle {
            cancelled,
            abort: Some(Arc::new(join.abort_handle())),
        }
    }

    fn on_signal(&self, signal: oneshot::Receiver<()>, task: Task) {
        self.handle.spawn(async move {
            if signal.await.is_ok() {
                task();
            }
        });
    }
}
