//! Base worker loop: call an async step function on an interval, with
//! early wake-up and clean shutdown.
//!
//! The step returns a "more work available" hint; `true` re-invokes on the
//! next scheduler turn with no sleep, `false` sleeps for the loop interval
//! (interruptible by [`IntervalWorker::notify`]). At most one step
//! invocation is ever in flight per worker. Step errors are logged and
//! treated as "no more work" so a transient storage failure never kills
//! the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// The polled step. Returns `Ok(true)` when another invocation is likely
/// to find more work immediately.
pub type StepFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// A single-flight interval loop around a step function.
pub struct IntervalWorker {
    name: &'static str,
    interval: Duration,
    step: StepFn,
    notify: Arc<Notify>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl IntervalWorker {
    pub fn new(name: &'static str, interval: Duration, step: StepFn) -> Self {
        Self::with_notify(name, interval, Arc::new(Notify::new()), step)
    }

    /// Build around an externally created notifier so the step itself can
    /// wake the loop (the task worker's refill path does this).
    pub fn with_notify(
        name: &'static str,
        interval: Duration,
        notify: Arc<Notify>,
        step: StepFn,
    ) -> Self {
        Self {
            name,
            interval,
            step,
            notify,
            running: Mutex::new(None),
        }
    }

    /// Start the loop; the step runs immediately. Idempotent while running,
    /// and allowed again after [`IntervalWorker::stop`].
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.name,
            self.interval,
            Arc::clone(&self.step),
            Arc::clone(&self.notify),
            shutdown.clone(),
        ));
        *running = Some(RunningLoop { shutdown, handle });
        debug!(worker = self.name, "worker started");
    }

    /// Cancel any pending sleep and run the step on the next turn. Multiple
    /// notifications while a step is in flight coalesce into one wake-up.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Stop the loop, waiting for an in-flight step to finish.
    pub async fn stop(&self) {
        let running = {
            let mut guard = self.running.lock().await;
            guard.take()
        };
        if let Some(running) = running {
            running.shutdown.cancel();
            let _ = running.handle.await;
            debug!(worker = self.name, "worker stopped");
        }
    }
}

async fn run_loop(
    name: &'static str,
    interval: Duration,
    step: StepFn,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let has_more = match step().await {
            Ok(has_more) => has_more,
            Err(e) => {
                error!(worker = name, error = %e, "worker step failed");
                false
            }
        };

        if has_more {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
