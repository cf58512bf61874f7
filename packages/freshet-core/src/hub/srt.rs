//! The TS-domain source: MPEG-TS publishers in, TS consumers out.
//!
//! The payload unit is a chunk of 188-byte TS packets as received from the
//! transport. Cross-domain delivery happens through the SRT bridge, which
//! demuxes the TS and feeds frames to the live and RTC domains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::bridge::{SrtBridge, SrtTarget};
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::SourceEvents;
use crate::request::StreamRequest;
use crate::runtime::coroutine::CoCond;

/// A subscriber's bounded queue of raw TS chunks.
pub struct SrtConsumer {
    id: u64,
    cid: ContextId,
    source: Weak<SrtSource>,
    queue: Mutex<VecDeque<Bytes>>,
    cond: CoCond,
    eos: AtomicBool,
    max_count: usize,
}

impl SrtConsumer {
    pub fn cid(&self) -> ContextId {
        self.cid
    }

    fn enqueue(&self, data: Bytes) -> ServerResult<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_count {
            return Err(ServerError::ConsumerOverflow(format!(
                "srt consumer cid={} exceeded {} chunks",
                self.cid, self.max_count
            )));
        }
        queue.push_back(data);
        drop(queue);
        self.cond.signal();
        Ok(())
    }

    /// Blocking dequeue with timeout; `Ok(None)` is end-of-stream.
    pub async fn dequeue(&self, timeout: Duration) -> ServerResult<Option<Bytes>> {
        loop {
            if let Some(data) = self.queue.lock().pop_front() {
                return Ok(Some(data));
            }
            if self.eos.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.cond
                .timedwait(timeout)
                .await
                .map_err(|e| e.wrap("srt dequeue"))?;
        }
    }

    fn on_unpublish(&self) {
        self.eos.store(true, Ordering::SeqCst);
        self.cond.broadcast();
    }
}

impl Drop for SrtConsumer {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.on_consumer_destroy(self.id);
        }
    }
}

/// The TS-domain source for one stream URL.
pub struct SrtSource {
    url: String,
    req: RwLock<Option<StreamRequest>>,
    publisher_cid: RwLock<Option<ContextId>>,
    active: AtomicBool,
    consumers: Mutex<Vec<(u64, Weak<SrtConsumer>)>>,
    bridge: Mutex<Option<Arc<dyn SrtBridge>>>,
    next_consumer_id: AtomicU64,
    max_queue: usize,
    events: Arc<SourceEvents>,
}

impl SrtSource {
    fn new(url: String, max_queue: usize, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            url,
            req: RwLock::new(None),
            publisher_cid: RwLock::new(None),
            active: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            bridge: Mutex::new(None),
            next_consumer_id: AtomicU64::new(1),
            max_queue,
            events,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Installs the demux bridge for the coming publish.
    pub fn set_bridge(&self, bridge: Arc<dyn SrtBridge>, req: &StreamRequest) -> ServerResult<()> {
        bridge.initialize(req)?;
        *self.bridge.lock() = Some(bridge);
        Ok(())
    }

    pub fn on_publish(&self, req: &StreamRequest, cid: ContextId) -> ServerResult<()> {
        *self.req.write() = Some(req.clone());
        *self.publisher_cid.write() = Some(cid);
        self.active.store(true, Ordering::SeqCst);

        if let Some(bridge) = self.bridge.lock().clone() {
            bridge.on_publish().map_err(|e| e.wrap("srt bridge publish"))?;
        }

        log::info!("[SrtSource] publish url={} cid={}", self.url, cid);
        self.events.notify_publish(req);
        Ok(())
    }

    pub fn on_unpublish(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let req = self.req.write().take();
        *self.publisher_cid.write() = None;

        let consumers: Vec<Arc<SrtConsumer>> = {
            let list = self.consumers.lock();
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            consumer.on_unpublish();
        }

        if let Some(bridge) = self.bridge.lock().take() {
            bridge.on_unpublish();
        }

        log::info!("[SrtSource] unpublish url={}", self.url);
        if let Some(req) = req {
            self.events.notify_unpublish(&req);
        }
    }

    /// Attaches a TS consumer.
    pub fn create_consumer(self: &Arc<Self>, cid: ContextId) -> Arc<SrtConsumer> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let consumer = Arc::new(SrtConsumer {
            id,
            cid,
            source: Arc::downgrade(self),
            queue: Mutex::new(VecDeque::new()),
            cond: CoCond::new(),
            eos: AtomicBool::new(false),
            max_count: self.max_queue,
        });
        self.consumers.lock().push((id, Arc::downgrade(&consumer)));
        consumer
    }

    pub fn on_consumer_destroy(&self, id: u64) {
        self.consumers.lock().retain(|(i, _)| *i != id);
    }
}

impl SrtTarget for SrtSource {
    fn on_packet(&self, data: &Bytes) -> ServerResult<()> {
        if let Some(bridge) = self.bridge.lock().clone() {
            bridge
                .on_packet(data)
                .map_err(|e| e.wrap(format!("srt bridge url={}", self.url)))?;
        }

        let consumers: Vec<Arc<SrtConsumer>> = {
            let mut list = self.consumers.lock();
            list.retain(|(_, w)| w.strong_count() > 0);
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            if let Err(err) = consumer.enqueue(data.clone()) {
                log::warn!(
                    "[SrtSource] drop consumer cid={} url={}: {}",
                    consumer.cid(),
                    self.url,
                    err
                );
            }
        }
        Ok(())
    }
}

/// Registry of TS-domain sources keyed by stream URL.
pub struct SrtSourceRegistry {
    sources: DashMap<String, Arc<SrtSource>>,
    max_queue: usize,
    events: Arc<SourceEvents>,
}

impl SrtSourceRegistry {
    pub fn new(max_queue: usize, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            sources: DashMap::new(),
            max_queue,
            events,
        })
    }

    pub fn fetch_or_create(&self, req: &StreamRequest) -> Arc<SrtSource> {
        let url = req.stream_url();
        Arc::clone(
            &self
                .sources
                .entry(url.clone())
                .or_insert_with(|| SrtSource::new(url, self.max_queue, Arc::clone(&self.events))),
        )
    }

    pub fn find(&self, url: &str) -> Option<Arc<SrtSource>> {
        self.sources.get(url).map(|r| Arc::clone(r.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> StreamRequest {
        StreamRequest::new("srt", "example.com", "live", "livestream", 10080)
    }

    #[tokio::test(start_paused = true)]
    async fn ts_chunks_reach_consumers() {
        let registry = SrtSourceRegistry::new(64, SourceEvents::new());
        let source = registry.fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();
        let consumer = source.create_consumer(ContextId::from_str("play"));

        source.on_packet(&Bytes::from_static(&[0x47, 0, 0])).unwrap();
        let chunk = consumer
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk[0], 0x47);

        source.on_unpublish();
        assert!(consumer
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }
}
