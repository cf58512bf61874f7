//! Background worker for off-critical-path blocking work.
//!
//! Publish/unpublish hooks, heartbeat posts and segment deletions must not
//! stall a media loop. Callers hand such work to the [`AsyncCallWorker`],
//! whose coroutine drains the queue and runs each task outside the lock so a
//! slow task never blocks submission.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::ContextId;
use crate::error::ServerResult;
use crate::runtime::coroutine::{CoCond, Coroutine, CoroutineHandler, TaskSpawner};

/// A unit of deferred work. Tasks own their cleanup; a failing task is
/// logged and swallowed.
#[async_trait]
pub trait AsyncCallTask: Send + Sync {
    /// Runs the task.
    async fn call(&self) -> ServerResult<()>;

    /// Short description for diagnostics.
    fn describe(&self) -> String;
}

struct WorkerInner {
    tasks: Mutex<Vec<Box<dyn AsyncCallTask>>>,
    cond: CoCond,
    co: Arc<Coroutine>,
}

/// The queue-draining worker.
pub struct AsyncCallWorker {
    inner: Arc<WorkerInner>,
}

impl AsyncCallWorker {
    /// Creates a stopped worker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                tasks: Mutex::new(Vec::new()),
                cond: CoCond::new(),
                co: Coroutine::new("async-call", ContextId::new()),
            }),
        }
    }

    /// Appends a task and signals the worker.
    pub fn execute(&self, task: Box<dyn AsyncCallTask>) {
        self.inner.tasks.lock().push(task);
        self.inner.cond.signal();
    }

    /// Number of queued tasks.
    pub fn count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Starts the worker coroutine.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        self.inner
            .co
            .start(spawner, Arc::clone(&self.inner) as Arc<dyn CoroutineHandler>);
    }

    /// Flushes pending tasks, then terminates the worker.
    pub async fn stop(&self) {
        self.inner.flush_tasks().await;
        self.inner.cond.signal();
        self.inner.co.stop();
        self.inner.co.join().await;
    }
}

impl Default for AsyncCallWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerInner {
    async fn flush_tasks(&self) {
        // Swap the queue out under the lock, run outside it.
        let batch: Vec<Box<dyn AsyncCallTask>> = {
            let mut tasks = self.tasks.lock();
            if tasks.is_empty() {
                return;
            }
            std::mem::take(&mut *tasks)
        };

        for task in batch {
            if let Err(err) = task.call().await {
                log::warn!("[AsyncCall] ignore task {} failed: {}", task.describe(), err);
            }
        }
    }
}

#[async_trait]
impl CoroutineHandler for WorkerInner {
    async fn cycle(&self) -> ServerResult<()> {
        loop {
            self.co.pull()?;

            if self.tasks.lock().is_empty() {
                self.co.drive(async {
                    self.cond.wait().await;
                    Ok(())
                })
                .await?;
            }

            self.flush_tasks().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::runtime::coroutine::TokioSpawner;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingTask {
        runs: Arc<AtomicU32>,
        drops: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl AsyncCallTask for CountingTask {
        async fn call(&self) -> ServerResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServerError::Internal("task error".into()));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    impl Drop for CountingTask {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn executes_queued_tasks_once() {
        let worker = AsyncCallWorker::new();
        worker.start(&TokioSpawner::current());

        let runs = Arc::new(AtomicU32::new(0));
        let drops = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            worker.execute(Box::new(CountingTask {
                runs: Arc::clone(&runs),
                drops: Arc::clone(&drops),
                fail: false,
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
        assert_eq!(worker.count(), 0);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tasks_are_swallowed() {
        let worker = AsyncCallWorker::new();
        worker.start(&TokioSpawner::current());

        let runs = Arc::new(AtomicU32::new(0));
        let drops = Arc::new(AtomicU32::new(0));
        worker.execute(Box::new(CountingTask {
            runs: Arc::clone(&runs),
            drops: Arc::clone(&drops),
            fail: true,
        }));
        worker.execute(Box::new(CountingTask {
            runs: Arc::clone(&runs),
            drops: Arc::clone(&drops),
            fail: false,
        }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_pending_tasks_without_leaks() {
        // Not started: tasks stay queued until stop() flushes them.
        let worker = AsyncCallWorker::new();

        let runs = Arc::new(AtomicU32::new(0));
        let drops = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            worker.execute(Box::new(CountingTask {
                runs: Arc::clone(&runs),
                drops: Arc::clone(&drops),
                fail: false,
            }));
        }
        assert_eq!(worker.count(), 3);

        worker.stop().await;

        // Every task submitted before stop ran exactly once and was
        // destroyed exactly once.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(worker.count(), 0);
    }
}
