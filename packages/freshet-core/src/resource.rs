//! Connection ownership with deferred disposal.
//!
//! The manager owns every live connection. `remove` only queues the
//! resource and returns: the actual drop runs later from the manager's own
//! coroutine, never from inside the resource's code paths, so a connection
//! can safely remove itself from within its own loop. Subscribers are
//! notified in two phases so they can drop cached references before the
//! resource is destroyed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use parking_lot::Mutex;

use crate::context::ContextId;
use crate::error::ServerResult;
use crate::runtime::coroutine::{CoCond, Coroutine, CoroutineHandler, TaskSpawner};

/// A managed connection or session.
pub trait Resource: Send + Sync {
    /// The resource's context id.
    fn cid(&self) -> ContextId;

    /// Short printable description for logs.
    fn desc(&self) -> String;
}

/// Observer of resource disposal.
pub trait DisposeHandler: Send + Sync {
    /// First phase: the resource is still fully alive; drop cached
    /// references now.
    fn on_before_dispose(&self, resource: &Arc<dyn Resource>);

    /// Second phase: the resource is about to be dropped.
    fn on_disposing(&self, resource: &Arc<dyn Resource>);
}

#[derive(Default)]
struct Registry {
    conns: Vec<Arc<dyn Resource>>,
    by_id: HashMap<ContextId, Arc<dyn Resource>>,
    by_fast_id: HashMap<u64, Arc<dyn Resource>>,
    by_name: HashMap<String, Arc<dyn Resource>>,
    zombies: Vec<Arc<dyn Resource>>,
}

impl Registry {
    fn unindex(&mut self, resource: &Arc<dyn Resource>) {
        self.conns.retain(|c| !same(c, resource));
        self.by_id.retain(|_, c| !same(c, resource));
        self.by_fast_id.retain(|_, c| !same(c, resource));
        self.by_name.retain(|_, c| !same(c, resource));
    }
}

fn same(a: &Arc<dyn Resource>, b: &Arc<dyn Resource>) -> bool {
    Arc::ptr_eq(a, b)
}

struct ManagerInner {
    label: String,
    co: Arc<Coroutine>,
    cond: CoCond,
    registry: Mutex<Registry>,
    handlers: Mutex<Vec<Weak<dyn DisposeHandler>>>,
}

/// Owner of connections with deferred dispose.
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    /// Creates a manager; call [`start`](Self::start) to begin disposals.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                label: label.into(),
                co: Coroutine::new("manager", ContextId::new()),
                cond: CoCond::new(),
                registry: Mutex::new(Registry::default()),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts the dispose coroutine.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        self.inner
            .co
            .start(spawner, Arc::clone(&self.inner) as Arc<dyn CoroutineHandler>);
    }

    /// Stops the dispose coroutine, dropping whatever is still queued.
    pub async fn stop(&self) {
        self.inner.co.stop();
        self.inner.co.join().await;
    }

    /// Adds a resource.
    pub fn add(&self, resource: Arc<dyn Resource>) {
        self.inner.registry.lock().conns.push(resource);
    }

    /// Adds a resource indexed by its context id.
    pub fn add_with_id(&self, id: ContextId, resource: Arc<dyn Resource>) {
        let mut reg = self.inner.registry.lock();
        reg.by_id.insert(id, Arc::clone(&resource));
        reg.conns.push(resource);
    }

    /// Adds a resource indexed by an integer fast id (e.g. a socket fd).
    pub fn add_with_fast_id(&self, id: u64, resource: Arc<dyn Resource>) {
        let mut reg = self.inner.registry.lock();
        reg.by_fast_id.insert(id, Arc::clone(&resource));
        reg.conns.push(resource);
    }

    /// Adds a resource indexed by name.
    pub fn add_with_name(&self, name: impl Into<String>, resource: Arc<dyn Resource>) {
        let mut reg = self.inner.registry.lock();
        reg.by_name.insert(name.into(), Arc::clone(&resource));
        reg.conns.push(resource);
    }

    pub fn find_by_id(&self, id: ContextId) -> Option<Arc<dyn Resource>> {
        self.inner.registry.lock().by_id.get(&id).cloned()
    }

    pub fn find_by_fast_id(&self, id: u64) -> Option<Arc<dyn Resource>> {
        self.inner.registry.lock().by_fast_id.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.inner.registry.lock().by_name.get(name).cloned()
    }

    /// Number of live (non-queued) resources.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().conns.len()
    }

    /// Whether no resources are managed.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.lock().conns.is_empty()
    }

    /// Queues the resource for disposal and returns immediately.
    pub fn remove(&self, resource: &Arc<dyn Resource>) {
        {
            let mut reg = self.inner.registry.lock();
            reg.unindex(resource);
            reg.zombies.push(Arc::clone(resource));
        }
        self.inner.cond.signal();
    }

    /// Subscribes a disposal observer (held weakly).
    pub fn subscribe(&self, handler: &Arc<dyn DisposeHandler>) {
        self.inner.handlers.lock().push(Arc::downgrade(handler));
    }

    /// Unsubscribes a disposal observer.
    pub fn unsubscribe(&self, handler: &Arc<dyn DisposeHandler>) {
        self.inner
            .handlers
            .lock()
            .retain(|w| w.upgrade().map_or(false, |h| !Arc::ptr_eq(&h, handler)));
    }
}

impl ManagerInner {
    fn clear(&self) {
        let zombies: Vec<Arc<dyn Resource>> = {
            let mut reg = self.registry.lock();
            std::mem::take(&mut reg.zombies)
        };
        if zombies.is_empty() {
            return;
        }

        let handlers: Vec<Arc<dyn DisposeHandler>> = {
            let mut list = self.handlers.lock();
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };

        // Phase one across the whole batch, then phase two: subscribers see
        // every doomed resource before any of them is destroyed.
        for zombie in &zombies {
            for handler in &handlers {
                handler.on_before_dispose(zombie);
            }
        }

        for zombie in zombies {
            for handler in &handlers {
                handler.on_disposing(&zombie);
            }
            log::debug!(
                "[Manager] {} dispose {} cid={}",
                self.label,
                zombie.desc(),
                zombie.cid()
            );
            drop(zombie);
        }
    }
}

#[async_trait]
impl CoroutineHandler for ManagerInner {
    async fn cycle(&self) -> ServerResult<()> {
        loop {
            self.co.pull()?;
            self.co
                .drive(async {
                    self.cond.wait().await;
                    Ok(())
                })
                .await?;
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::coroutine::TokioSpawner;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct TestConn {
        cid: ContextId,
        drops: Arc<AtomicU32>,
    }

    impl Resource for TestConn {
        fn cid(&self) -> ContextId {
            self.cid
        }

        fn desc(&self) -> String {
            "test-conn".into()
        }
    }

    impl Drop for TestConn {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PhaseRecorder {
        phases: Mutex<Vec<&'static str>>,
    }

    impl DisposeHandler for PhaseRecorder {
        fn on_before_dispose(&self, _r: &Arc<dyn Resource>) {
            self.phases.lock().push("before");
        }

        fn on_disposing(&self, _r: &Arc<dyn Resource>) {
            self.phases.lock().push("disposing");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn removal_is_deferred_to_manager_cycle() {
        let mgr = ResourceManager::new("conns");
        let drops = Arc::new(AtomicU32::new(0));
        let conn: Arc<dyn Resource> = Arc::new(TestConn {
            cid: ContextId::new(),
            drops: Arc::clone(&drops),
        });
        mgr.add(Arc::clone(&conn));

        mgr.remove(&conn);
        drop(conn);
        // Not started yet: the resource must still be alive.
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        mgr.start(&TokioSpawner::current());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(mgr.is_empty());
        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_two_phases_in_order() {
        let mgr = ResourceManager::new("conns");
        mgr.start(&TokioSpawner::current());

        let recorder = Arc::new(PhaseRecorder {
            phases: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn DisposeHandler> = recorder.clone();
        mgr.subscribe(&handler);

        let drops = Arc::new(AtomicU32::new(0));
        let conn: Arc<dyn Resource> = Arc::new(TestConn {
            cid: ContextId::new(),
            drops,
        });
        mgr.add(Arc::clone(&conn));
        mgr.remove(&conn);
        drop(conn);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(*recorder.phases.lock(), vec!["before", "disposing"]);
        mgr.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn find_by_indexes() {
        let mgr = ResourceManager::new("conns");
        let drops = Arc::new(AtomicU32::new(0));
        let cid = ContextId::from_str("abcd");
        let conn: Arc<dyn Resource> = Arc::new(TestConn {
            cid,
            drops: Arc::clone(&drops),
        });

        mgr.add_with_id(cid, Arc::clone(&conn));
        mgr.add_with_fast_id(42, Arc::clone(&conn));
        mgr.add_with_name("srt-listener", Arc::clone(&conn));

        assert!(mgr.find_by_id(cid).is_some());
        assert!(mgr.find_by_fast_id(42).is_some());
        assert!(mgr.find_by_name("srt-listener").is_some());
        assert!(mgr.find_by_fast_id(7).is_none());

        // Removing unindexes everywhere.
        mgr.remove(&conn);
        assert!(mgr.find_by_id(cid).is_none());
        assert!(mgr.find_by_fast_id(42).is_none());
        assert!(mgr.find_by_name("srt-listener").is_none());
    }
}
