/// Concurrency Gate - bounded task pool with failure isolation
///
/// At most `max_parallel` submitted tasks run at the same time. A task that
/// returns `Err` or panics is counted and handed to the error callback; it
/// never takes down its siblings or the gate.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::warn;

pub type ErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

struct GateInner {
    max_parallel: usize,
    semaphore: Arc<Semaphore>,
    pending: AtomicUsize,
    exception_count: AtomicUsize,
    idle: Notify,
    on_error: Option<ErrorCallback>,
}

#[derive(Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    pub fn new(max_parallel: usize) -> Self {
        Self::build(max_parallel, None)
    }

    pub fn with_error_callback(max_parallel: usize, on_error: ErrorCallback) -> Self {
        Self::build(max_parallel, Some(on_error))
    }

    fn build(max_parallel: usize, on_error: Option<ErrorCallback>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_parallel,
                semaphore: Arc::new(Semaphore::new(max_parallel)),
                pending: AtomicUsize::new(0),
                exception_count: AtomicUsize::new(0),
                idle: Notify::new(),
                on_error,
            }),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.inner.max_parallel
    }

    /// Tasks submitted and not yet completed, including ones still waiting
    /// for admission
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn slots_free(&self) -> usize {
        self.inner.max_parallel.saturating_sub(self.pending())
    }

    pub fn exception_count(&self) -> usize {
        self.inner.exception_count.load(Ordering::SeqCst)
    }

    /// Admits `task` once a slot is free, suspending the caller until then.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let permit = match self.inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // The semaphore is never closed while the gate is alive
                self.complete(Some(anyhow::anyhow!("concurrency gate closed")));
                return;
            }
        };

        let gate = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            drop(permit);
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(anyhow::anyhow!("task panicked: {}", panic_message(&*panic))),
            };
            gate.complete(failure);
        });
    }

    fn complete(&self, failure: Option<anyhow::Error>) {
        if let Some(e) = failure {
            self.inner.exception_count.fetch_add(1, Ordering::SeqCst);
            match &self.inner.on_error {
                Some(callback) => callback(&e),
                None => warn!(error = %e, "Task failed inside concurrency gate"),
            }
        }
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
    }

    /// Suspends until no task is pending anymore
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
