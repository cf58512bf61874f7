//! Named cooperative tasks with stop/interrupt semantics.
//!
//! A [`Coroutine`] wraps one spawned task. The owning component keeps the
//! handle and calls [`Coroutine::stop`] to request shutdown; the task itself
//! calls [`Coroutine::pull`] at the top of its loop and unwinds when it
//! returns the interrupted error. [`Coroutine::interrupt`] is a non-blocking
//! wakeup that makes the current suspension return early without stopping
//! the task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};

/// Abstraction for spawning background tasks.
///
/// Allows runtime primitives to spawn asynchronous work without knowing the
/// underlying executor, so tests can substitute their own.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task, returning its join handle.
    fn spawn(&self, future: BoxFuture<'static, ()>) -> JoinHandle<()>;
}

/// Tokio-based spawner for the server and general use.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) -> JoinHandle<()> {
        self.handle.spawn(future)
    }
}

/// Handler whose `cycle` is driven once by a started coroutine.
///
/// The return value is the terminal status: an error classified as
/// interrupted (see [`ServerError::is_interrupted`]) means the handler
/// observed a cooperative stop and unwound normally; any other error is
/// logged by the runtime.
#[async_trait]
pub trait CoroutineHandler: Send + Sync {
    /// Runs the coroutine body until completion or cooperative stop.
    async fn cycle(&self) -> ServerResult<()>;
}

/// A named cooperative task.
///
/// The handle outlives the spawned task and is safe to drop from anywhere,
/// including from a different coroutine than the one it runs.
pub struct Coroutine {
    name: String,
    cid: RwLock<ContextId>,
    cancel: CancellationToken,
    wakeup: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coroutine {
    /// Creates a stopped coroutine handle with a name and context id.
    pub fn new(name: impl Into<String>, cid: ContextId) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cid: RwLock::new(cid),
            cancel: CancellationToken::new(),
            wakeup: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /// Starts the handler's cycle on the spawner.
    ///
    /// Idempotent: a second start while the task is running is a no-op.
    pub fn start(
        self: &Arc<Self>,
        spawner: &dyn TaskSpawner,
        handler: Arc<dyn CoroutineHandler>,
    ) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let this = Arc::clone(self);
        let handle = spawner.spawn(Box::pin(async move {
            let result = handler.cycle().await;
            match result {
                Ok(()) => {
                    log::debug!("[Coroutine] {} cid={} finished", this.name, this.cid());
                }
                Err(err) if err.is_interrupted() => {
                    log::debug!("[Coroutine] {} cid={} stopped: {}", this.name, this.cid(), err);
                }
                Err(err) => {
                    log::warn!("[Coroutine] {} cid={} failed: {}", this.name, this.cid(), err);
                }
            }
        }));
        *slot = Some(handle);
    }

    /// Requests a cooperative stop.
    ///
    /// The task observes it at its next [`pull`](Self::pull) or suspension
    /// and unwinds normally. Safe to call from the coroutine itself.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.wakeup.notify_waiters();
    }

    /// Non-blocking wakeup: the current (or next) suspension returns early.
    pub fn interrupt(&self) {
        self.wakeup.notify_one();
    }

    /// Returns the interrupted error once a stop has been requested.
    pub fn pull(&self) -> ServerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::Interrupted(self.name.clone()));
        }
        Ok(())
    }

    /// Whether a stop has been requested.
    pub fn stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The coroutine's context id.
    pub fn cid(&self) -> ContextId {
        *self.cid.read()
    }

    /// Reassigns the context id (e.g. after a connection identifies itself).
    pub fn set_cid(&self, cid: ContextId) {
        *self.cid.write() = cid;
    }

    /// The coroutine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Suspends until the duration elapses, an interrupt arrives, or a stop
    /// is requested.
    ///
    /// Returns `Ok` on elapse or interrupt, the interrupted error on stop.
    pub async fn sleep(&self, duration: Duration) -> ServerResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.wakeup.notified() => self.pull(),
            _ = self.cancel.cancelled() => {
                Err(ServerError::Interrupted(self.name.clone()))
            }
        }
    }

    /// Runs a future until it completes or the coroutine is stopped.
    ///
    /// This is the fd-wait shape: reads and writes of a connection loop are
    /// wrapped so a `stop` interrupts the pending I/O.
    pub async fn drive<T, F>(&self, fut: F) -> ServerResult<T>
    where
        F: Future<Output = ServerResult<T>>,
    {
        tokio::select! {
            r = fut => r,
            _ = self.cancel.cancelled() => {
                Err(ServerError::Interrupted(self.name.clone()))
            }
        }
    }

    /// Waits for the spawned task to finish, if one was started.
    ///
    /// Must not be called from the coroutine itself.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // A dropped handle must not leave the task running forever.
        self.cancel.cancel();
    }
}

/// Cooperative condition variable.
///
/// `signal` stores at most one permit, so a signal racing ahead of the
/// waiter is not lost; `broadcast` wakes every currently parked waiter.
pub struct CoCond {
    notify: Notify,
}

impl CoCond {
    /// Creates a new condition.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
        }
    }

    /// Parks the caller until signalled.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Parks the caller until signalled or the timeout elapses.
    pub async fn timedwait(&self, timeout: Duration) -> ServerResult<()> {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .map_err(|_| ServerError::Timeout(format!("cond timedwait {}ms", timeout.as_millis())))
    }

    /// Wakes one waiter, or stores a permit for the next one.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Wakes all currently parked waiters.
    pub fn broadcast(&self) {
        self.notify.notify_waiters();
    }
}

impl Default for CoCond {
    fn default() -> Self {
        Self::new()
    }
}

/// Join-counter for anonymous helper tasks.
///
/// The owner calls [`add`](Self::add) before spawning each helper, helpers
/// call [`done`](Self::done) when finishing, and the owner parks in
/// [`wait`](Self::wait) until the count returns to zero.
pub struct WaitGroup {
    count: Mutex<i64>,
    notify: Notify,
}

impl WaitGroup {
    /// Creates an empty wait group.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            notify: Notify::new(),
        })
    }

    /// Registers `n` pending helpers.
    pub fn add(&self, n: i64) {
        *self.count.lock() += n;
    }

    /// Marks one helper as finished.
    pub fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count <= 0 {
            self.notify.notify_waiters();
        }
    }

    /// Parks until every registered helper has called [`done`](Self::done).
    pub async fn wait(&self) {
        loop {
            // Register interest before checking the count so a racing
            // `done` cannot slip between the check and the park.
            let notified = self.notify.notified();
            if *self.count.lock() <= 0 {
                return;
            }
            notified.await;
        }
    }
}
