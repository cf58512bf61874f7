//! The RTP-domain source: RTC publishers in, RTP consumers out.
//!
//! Mirrors the live source in shape, but the unit of fan-out is an RTP
//! packet. Players that need a fresh keyframe (after abandoning NACKs) ask
//! the source, which forwards the request to whatever is feeding it - the
//! publisher's connection or an RTMP bridge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::bridge::{RtpBridge, RtpTarget};
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::{live::ConsumerBounds, SourceEvents};
use crate::request::StreamRequest;
use crate::rtp::RtpPacket;
use crate::runtime::coroutine::CoCond;

/// Receiver of keyframe requests escalated by players.
pub trait KeyframeRequester: Send + Sync {
    fn request_keyframe(&self, ssrc: u32, cid: ContextId);
}

/// A subscriber's bounded RTP queue.
pub struct RtcConsumer {
    id: u64,
    cid: ContextId,
    source: Weak<RtcSource>,
    queue: Mutex<VecDeque<Arc<RtpPacket>>>,
    cond: CoCond,
    eos: AtomicBool,
    overflow: AtomicBool,
    max_count: usize,
}

impl RtcConsumer {
    pub fn cid(&self) -> ContextId {
        self.cid
    }

    fn enqueue(&self, pkt: Arc<RtpPacket>) -> ServerResult<()> {
        if self.overflow.load(Ordering::SeqCst) {
            return Err(ServerError::ConsumerOverflow(format!(
                "rtc consumer cid={} already overflowed",
                self.cid
            )));
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_count {
            drop(queue);
            self.overflow.store(true, Ordering::SeqCst);
            self.cond.broadcast();
            return Err(ServerError::ConsumerOverflow(format!(
                "rtc consumer cid={} exceeded {} packets",
                self.cid, self.max_count
            )));
        }
        queue.push_back(pkt);
        drop(queue);
        self.cond.signal();
        Ok(())
    }

    /// Blocking dequeue with timeout; `Ok(None)` is end-of-stream.
    pub async fn dequeue(&self, timeout: Duration) -> ServerResult<Option<Arc<RtpPacket>>> {
        loop {
            if let Some(pkt) = self.queue.lock().pop_front() {
                return Ok(Some(pkt));
            }
            if self.overflow.load(Ordering::SeqCst) {
                return Err(ServerError::ConsumerOverflow(format!(
                    "rtc consumer cid={} dropped: queue exceeded its bound",
                    self.cid
                )));
            }
            if self.eos.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.cond
                .timedwait(timeout)
                .await
                .map_err(|e| e.wrap("rtc dequeue"))?;
        }
    }

    fn on_unpublish(&self) {
        self.eos.store(true, Ordering::SeqCst);
        self.cond.broadcast();
    }
}

impl Drop for RtcConsumer {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.on_consumer_destroy(self.id);
        }
    }
}

/// The RTP-domain source for one stream URL.
pub struct RtcSource {
    url: String,
    req: RwLock<Option<StreamRequest>>,
    publisher_cid: RwLock<Option<ContextId>>,
    active: AtomicBool,
    consumers: Mutex<Vec<(u64, Weak<RtcConsumer>)>>,
    bridge: Mutex<Option<Arc<dyn RtpBridge>>>,
    keyframe_requester: Mutex<Option<Weak<dyn KeyframeRequester>>>,
    next_consumer_id: AtomicU64,
    max_queue: usize,
    events: Arc<SourceEvents>,
}

impl RtcSource {
    fn new(url: String, max_queue: usize, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            url,
            req: RwLock::new(None),
            publisher_cid: RwLock::new(None),
            active: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            bridge: Mutex::new(None),
            keyframe_requester: Mutex::new(None),
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

    pub fn publisher_cid(&self) -> Option<ContextId> {
        *self.publisher_cid.read()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Installs the RTP-to-frame bridge for the coming publish.
    pub fn set_bridge(&self, bridge: Arc<dyn RtpBridge>, req: &StreamRequest) -> ServerResult<()> {
        bridge.initialize(req)?;
        *self.bridge.lock() = Some(bridge);
        Ok(())
    }

    /// Registers where keyframe requests should land.
    pub fn set_keyframe_requester(&self, requester: Weak<dyn KeyframeRequester>) {
        *self.keyframe_requester.lock() = Some(requester);
    }

    /// Escalates a keyframe request to the publisher side.
    pub fn request_keyframe(&self, ssrc: u32, cid: ContextId) {
        let requester = self.keyframe_requester.lock().clone();
        match requester.and_then(|w| w.upgrade()) {
            Some(requester) => requester.request_keyframe(ssrc, cid),
            None => log::debug!(
                "[RtcSource] no keyframe requester url={} ssrc={}",
                self.url,
                ssrc
            ),
        }
    }

    pub fn on_publish(&self, req: &StreamRequest, cid: ContextId) -> ServerResult<()> {
        *self.req.write() = Some(req.clone());
        *self.publisher_cid.write() = Some(cid);
        self.active.store(true, Ordering::SeqCst);

        if let Some(bridge) = self.bridge.lock().clone() {
            bridge.on_publish().map_err(|e| e.wrap("rtc bridge publish"))?;
        }

        log::info!("[RtcSource] publish url={} cid={}", self.url, cid);
        self.events.notify_publish(req);
        Ok(())
    }

    pub fn on_unpublish(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let req = self.req.write().take();
        *self.publisher_cid.write() = None;

        let consumers: Vec<Arc<RtcConsumer>> = {
            let list = self.consumers.lock();
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            consumer.on_unpublish();
        }

        if let Some(bridge) = self.bridge.lock().take() {
            bridge.on_unpublish();
        }

        log::info!("[RtcSource] unpublish url={}", self.url);
        if let Some(req) = req {
            self.events.notify_unpublish(&req);
        }
    }

    /// Attaches an RTP consumer.
    pub fn create_consumer(self: &Arc<Self>, cid: ContextId) -> Arc<RtcConsumer> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let consumer = Arc::new(RtcConsumer {
            id,
            cid,
            source: Arc::downgrade(self),
            queue: Mutex::new(VecDeque::new()),
            cond: CoCond::new(),
            eos: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            max_count: self.max_queue,
        });
        self.consumers.lock().push((id, Arc::downgrade(&consumer)));
        consumer
    }

    pub fn on_consumer_destroy(&self, id: u64) {
        self.consumers.lock().retain(|(i, _)| *i != id);
    }
}

impl RtpTarget for RtcSource {
    fn on_rtp(&self, pkt: &Arc<RtpPacket>) -> ServerResult<()> {
        if let Some(bridge) = self.bridge.lock().clone() {
            bridge
                .on_rtp(pkt)
                .map_err(|e| e.wrap(format!("rtc bridge url={}", self.url)))?;
        }

        let consumers: Vec<Arc<RtcConsumer>> = {
            let mut list = self.consumers.lock();
            list.retain(|(_, w)| w.strong_count() > 0);
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            if let Err(err) = consumer.enqueue(Arc::clone(pkt)) {
                log::warn!(
                    "[RtcSource] drop consumer cid={} url={}: {}",
                    consumer.cid(),
                    self.url,
                    err
                );
            }
        }
        Ok(())
    }
}

/// Registry of RTP-domain sources keyed by stream URL.
pub struct RtcSourceRegistry {
    sources: DashMap<String, Arc<RtcSource>>,
    max_queue: usize,
    events: Arc<SourceEvents>,
}

impl RtcSourceRegistry {
    /// Creates a registry; `bounds.max_count` bounds the RTP queues.
    pub fn new(bounds: ConsumerBounds, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            sources: DashMap::new(),
            max_queue: bounds.max_count,
            events,
        })
    }

    pub fn fetch_or_create(&self, req: &StreamRequest) -> Arc<RtcSource> {
        let url = req.stream_url();
        Arc::clone(
            &self
                .sources
                .entry(url.clone())
                .or_insert_with(|| RtcSource::new(url, self.max_queue, Arc::clone(&self.events))),
        )
    }

    pub fn find(&self, url: &str) -> Option<Arc<RtcSource>> {
        self.sources.get(url).map(|r| Arc::clone(r.value()))
    }
}
