//! The frame-domain source: RTMP publishers in, frame consumers out.
//!
//! One [`LiveSource`] per stream URL. The publisher's connection calls
//! [`LiveSource::on_frame`] for every packet; the source refreshes the
//! header cache, feeds bridges first, then every consumer queue. A consumer
//! attaching mid-stream is bootstrapped with the cached metadata and
//! sequence headers before any live frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::bridge::{FrameTarget, StreamBridge};
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::SourceEvents;
use crate::packet::MediaPacket;
use crate::request::StreamRequest;
use crate::runtime::coroutine::CoCond;

/// Queue bounds for a consumer: whichever of count or buffered duration is
/// exceeded first overflows the consumer.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerBounds {
    pub max_count: usize,
    pub max_duration_ms: i64,
}

impl Default for ConsumerBounds {
    fn default() -> Self {
        Self {
            max_count: 1024,
            max_duration_ms: 30_000,
        }
    }
}

/// Cached stream preamble for bootstrapping late consumers.
#[derive(Default, Clone)]
struct MetaCache {
    metadata: Option<Arc<MediaPacket>>,
    audio_sh: Option<Arc<MediaPacket>>,
    video_sh: Option<Arc<MediaPacket>>,
}

impl MetaCache {
    fn clear(&mut self) {
        self.metadata = None;
        self.audio_sh = None;
        self.video_sh = None;
    }
}

/// A subscriber's bounded frame queue.
pub struct LiveConsumer {
    id: u64,
    cid: ContextId,
    source: Weak<LiveSource>,
    queue: Mutex<VecDeque<Arc<MediaPacket>>>,
    cond: CoCond,
    eos: AtomicBool,
    overflow: AtomicBool,
    bounds: ConsumerBounds,
}

impl LiveConsumer {
    /// The consumer's context id.
    pub fn cid(&self) -> ContextId {
        self.cid
    }

    /// Buffered packet count.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn enqueue(&self, pkt: Arc<MediaPacket>) -> ServerResult<()> {
        if self.overflow.load(Ordering::SeqCst) {
            return Err(ServerError::ConsumerOverflow(format!(
                "consumer cid={} already overflowed",
                self.cid
            )));
        }

        let mut queue = self.queue.lock();
        let over_count = queue.len() >= self.bounds.max_count;
        let over_duration = match (queue.front(), queue.back()) {
            (Some(front), Some(back)) => {
                back.timestamp.saturating_sub(front.timestamp) > self.bounds.max_duration_ms
            }
            _ => false,
        };
        if over_count || over_duration {
            drop(queue);
            self.overflow.store(true, Ordering::SeqCst);
            self.cond.broadcast();
            return Err(ServerError::ConsumerOverflow(format!(
                "consumer cid={} exceeded {} packets / {}ms",
                self.cid, self.bounds.max_count, self.bounds.max_duration_ms
            )));
        }

        queue.push_back(pkt);
        drop(queue);
        self.cond.signal();
        Ok(())
    }

    /// Blocking dequeue with timeout.
    ///
    /// Returns `Ok(Some(..))` for a packet, `Ok(None)` once the source
    /// unpublished and the queue drained (the defined end-of-stream signal),
    /// a timeout error when nothing arrived in time, and an overflow error
    /// when this consumer fell too far behind and was dropped.
    pub async fn dequeue(&self, timeout: Duration) -> ServerResult<Option<Arc<MediaPacket>>> {
        loop {
            if let Some(pkt) = self.queue.lock().pop_front() {
                return Ok(Some(pkt));
            }
            if self.overflow.load(Ordering::SeqCst) {
                return Err(ServerError::ConsumerOverflow(format!(
                    "consumer cid={} dropped: queue exceeded its bound",
                    self.cid
                )));
            }
            if self.eos.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.cond
                .timedwait(timeout)
                .await
                .map_err(|e| e.wrap("consumer dequeue"))?;
        }
    }

    fn on_unpublish(&self) {
        self.eos.store(true, Ordering::SeqCst);
        self.cond.broadcast();
    }
}

impl Drop for LiveConsumer {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.on_consumer_destroy(self.id);
        }
    }
}

/// The frame-domain source for one stream URL.
pub struct LiveSource {
    url: String,
    req: RwLock<Option<StreamRequest>>,
    publisher_cid: RwLock<Option<ContextId>>,
    active: AtomicBool,
    cache: Mutex<MetaCache>,
    consumers: Mutex<Vec<(u64, Weak<LiveConsumer>)>>,
    bridge: Mutex<Option<Arc<dyn StreamBridge>>>,
    next_consumer_id: AtomicU64,
    bounds: ConsumerBounds,
    events: Arc<SourceEvents>,
}

impl LiveSource {
    fn new(url: String, bounds: ConsumerBounds, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            url,
            req: RwLock::new(None),
            publisher_cid: RwLock::new(None),
            active: AtomicBool::new(false),
            cache: Mutex::new(MetaCache::default()),
            consumers: Mutex::new(Vec::new()),
            bridge: Mutex::new(None),
            next_consumer_id: AtomicU64::new(1),
            bounds,
            events,
        })
    }

    /// The stream URL keying this source.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a publisher is currently active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The current publisher's context id, for diagnostics.
    pub fn publisher_cid(&self) -> Option<ContextId> {
        *self.publisher_cid.read()
    }

    /// Number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Installs the cross-domain bridge for the coming publish.
    pub fn set_bridge(&self, bridge: Arc<dyn StreamBridge>, req: &StreamRequest) -> ServerResult<()> {
        bridge.initialize(req)?;
        *self.bridge.lock() = Some(bridge);
        Ok(())
    }

    /// Marks the source published.
    ///
    /// The caller holds the publish token; the source only records the new
    /// publisher and starts its bridge.
    pub fn on_publish(&self, req: &StreamRequest, cid: ContextId) -> ServerResult<()> {
        *self.req.write() = Some(req.clone());
        *self.publisher_cid.write() = Some(cid);
        self.active.store(true, Ordering::SeqCst);

        if let Some(bridge) = self.bridge.lock().clone() {
            bridge.on_publish().map_err(|e| e.wrap("bridge publish"))?;
        }

        log::info!("[Source] publish url={} cid={}", self.url, cid);
        self.events.notify_publish(req);
        Ok(())
    }

    /// Marks the source unpublished: clears the header cache, signals
    /// end-of-stream to every consumer and stops the bridge.
    pub fn on_unpublish(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let req = self.req.write().take();
        *self.publisher_cid.write() = None;
        self.cache.lock().clear();

        let consumers: Vec<Arc<LiveConsumer>> = {
            let list = self.consumers.lock();
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            consumer.on_unpublish();
        }

        if let Some(bridge) = self.bridge.lock().take() {
            bridge.on_unpublish();
        }

        log::info!("[Source] unpublish url={}", self.url);
        if let Some(req) = req {
            self.events.notify_unpublish(&req);
        }
    }

    /// Attaches a consumer, bootstrapping it with the cached preamble.
    pub fn create_consumer(self: &Arc<Self>, cid: ContextId) -> Arc<LiveConsumer> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let consumer = Arc::new(LiveConsumer {
            id,
            cid,
            source: Arc::downgrade(self),
            queue: Mutex::new(VecDeque::new()),
            cond: CoCond::new(),
            eos: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            bounds: self.bounds,
        });
        self.consumers.lock().push((id, Arc::downgrade(&consumer)));

        // Metadata, then audio header, then video header, then live frames.
        let cache = self.cache.lock().clone();
        for pkt in [cache.metadata, cache.audio_sh, cache.video_sh]
            .into_iter()
            .flatten()
        {
            let _ = consumer.enqueue(pkt);
        }

        log::debug!(
            "[Source] consumer attached url={} cid={} consumers={}",
            self.url,
            cid,
            self.consumer_count()
        );
        consumer
    }

    /// Detaches a consumer; called from the consumer's drop.
    pub fn on_consumer_destroy(&self, id: u64) {
        self.consumers.lock().retain(|(i, _)| *i != id);
    }
}

impl FrameTarget for LiveSource {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        // Cache updates happen even with no consumers attached.
        {
            let mut cache = self.cache.lock();
            if frame.is_metadata() {
                cache.metadata = Some(Arc::clone(frame));
            } else if frame.is_audio_sequence_header() {
                cache.audio_sh = Some(Arc::clone(frame));
            } else if frame.is_video_sequence_header() {
                cache.video_sh = Some(Arc::clone(frame));
            }
        }

        // Bridges run before consumers; their failure is the publisher's.
        if let Some(bridge) = self.bridge.lock().clone() {
            bridge
                .on_frame(frame)
                .map_err(|e| e.wrap(format!("bridge frame url={}", self.url)))?;
        }

        let consumers: Vec<Arc<LiveConsumer>> = {
            let mut list = self.consumers.lock();
            list.retain(|(_, w)| w.strong_count() > 0);
            list.iter().filter_map(|(_, w)| w.upgrade()).collect()
        };
        for consumer in consumers {
            if let Err(err) = consumer.enqueue(Arc::clone(frame)) {
                // A sick consumer never aborts the fan-out.
                log::warn!(
                    "[Source] drop consumer cid={} url={}: {}",
                    consumer.cid(),
                    self.url,
                    err
                );
            }
        }
        Ok(())
    }
}

/// Registry of frame-domain sources keyed by stream URL.
pub struct LiveSourceRegistry {
    sources: DashMap<String, Arc<LiveSource>>,
    bounds: ConsumerBounds,
    events: Arc<SourceEvents>,
}

impl LiveSourceRegistry {
    /// Creates a registry with the given consumer bounds.
    pub fn new(bounds: ConsumerBounds, events: Arc<SourceEvents>) -> Arc<Self> {
        Arc::new(Self {
            sources: DashMap::new(),
            bounds,
            events,
        })
    }

    /// Finds or creates the source for the request's URL.
    pub fn fetch_or_create(&self, req: &StreamRequest) -> Arc<LiveSource> {
        let url = req.stream_url();
        Arc::clone(
            &self
                .sources
                .entry(url.clone())
                .or_insert_with(|| LiveSource::new(url, self.bounds, Arc::clone(&self.events))),
        )
    }

    /// Looks up an existing source.
    pub fn find(&self, url: &str) -> Option<Arc<LiveSource>> {
        self.sources.get(url).map(|r| Arc::clone(r.value()))
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no sources exist.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        aac_frame_payload, aac_sequence_header_payload, avc_frame_payload,
        avc_sequence_header_payload, PacketKind,
    };
    use bytes::Bytes;

    fn registry() -> Arc<LiveSourceRegistry> {
        LiveSourceRegistry::new(ConsumerBounds::default(), SourceEvents::new())
    }

    fn req() -> StreamRequest {
        StreamRequest::new("rtmp", "example.com", "live", "livestream", 1935)
    }

    fn metadata() -> Arc<MediaPacket> {
        MediaPacket::new(PacketKind::Metadata, 0, Bytes::from_static(b"onMetaData"))
    }

    fn audio_sh() -> Arc<MediaPacket> {
        MediaPacket::new(PacketKind::Audio, 0, aac_sequence_header_payload(&[0x12, 0x10]))
    }

    fn video_sh() -> Arc<MediaPacket> {
        MediaPacket::new(
            PacketKind::Video,
            0,
            avc_sequence_header_payload(&[0x01, 0x64, 0x00, 0x1f, 0xff, 0xe1]),
        )
    }

    fn keyframe(ts: i64) -> Arc<MediaPacket> {
        MediaPacket::new(PacketKind::Video, ts, avc_frame_payload(true, 0, &[0, 0, 0, 1, 0x65]))
    }

    fn audio(ts: i64) -> Arc<MediaPacket> {
        MediaPacket::new(PacketKind::Audio, ts, aac_frame_payload(&[0xaa]))
    }

    #[tokio::test(start_paused = true)]
    async fn late_player_gets_preamble_then_live_frames() {
        // Publisher sends metadata + both headers + a keyframe + audio; the
        // player connects after the keyframe and must observe the cached
        // preamble first, then live frames only.
        let source = registry().fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();

        source.on_frame(&metadata()).unwrap();
        source.on_frame(&audio_sh()).unwrap();
        source.on_frame(&video_sh()).unwrap();
        source.on_frame(&keyframe(40)).unwrap();

        let consumer = source.create_consumer(ContextId::from_str("play"));
        source.on_frame(&audio(60)).unwrap();

        let t = Duration::from_millis(100);
        let first = consumer.dequeue(t).await.unwrap().unwrap();
        assert!(first.is_metadata());
        let second = consumer.dequeue(t).await.unwrap().unwrap();
        assert!(second.is_audio_sequence_header());
        let third = consumer.dequeue(t).await.unwrap().unwrap();
        assert!(third.is_video_sequence_header());
        let fourth = consumer.dequeue(t).await.unwrap().unwrap();
        assert_eq!(fourth.timestamp, 60);
        assert!(fourth.is_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn all_frames_flow_in_order_to_early_consumer() {
        let source = registry().fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();
        let consumer = source.create_consumer(ContextId::from_str("play"));

        source.on_frame(&metadata()).unwrap();
        source.on_frame(&audio_sh()).unwrap();
        source.on_frame(&video_sh()).unwrap();
        source.on_frame(&keyframe(40)).unwrap();
        source.on_frame(&audio(60)).unwrap();

        let t = Duration::from_millis(100);
        let mut stamps = Vec::new();
        for _ in 0..5 {
            stamps.push(consumer.dequeue(t).await.unwrap().unwrap().timestamp);
        }
        assert_eq!(stamps, vec![0, 0, 0, 40, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn unpublish_signals_end_of_stream() {
        let source = registry().fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();
        let consumer = source.create_consumer(ContextId::from_str("play"));

        source.on_frame(&audio(20)).unwrap();
        source.on_unpublish();

        let t = Duration::from_millis(100);
        assert!(consumer.dequeue(t).await.unwrap().is_some());
        // Defined end-of-stream signal instead of indefinite blocking.
        assert!(consumer.dequeue(t).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unpublish_clears_cache_for_next_publisher() {
        let source = registry().fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();
        source.on_frame(&video_sh()).unwrap();
        source.on_unpublish();

        source.on_publish(&req(), ContextId::from_str("pub2")).unwrap();
        let consumer = source.create_consumer(ContextId::from_str("play"));
        // Fresh publisher: nothing cached yet.
        assert!(consumer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out_when_idle() {
        let source = registry().fetch_or_create(&req());
        let consumer = source.create_consumer(ContextId::from_str("play"));
        let err = consumer.dequeue(Duration::from_millis(30)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn overflowing_consumer_is_dropped_not_the_source() {
        let events = SourceEvents::new();
        let registry = LiveSourceRegistry::new(
            ConsumerBounds {
                max_count: 2,
                max_duration_ms: 60_000,
            },
            events,
        );
        let source = registry.fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();

        let slow = source.create_consumer(ContextId::from_str("slow"));
        for i in 0..4 {
            // Fan-out must keep succeeding while the consumer overflows.
            source.on_frame(&audio(i * 20)).unwrap();
        }

        let err = slow.dequeue(Duration::from_millis(10)).await;
        // The consumer drains its two buffered packets, then observes the
        // overflow verdict.
        assert!(err.unwrap().is_some());
        let _ = slow.dequeue(Duration::from_millis(10)).await;
        let verdict = slow.dequeue(Duration::from_millis(10)).await;
        assert!(matches!(verdict, Err(ServerError::ConsumerOverflow(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_detaches_from_source() {
        let source = registry().fetch_or_create(&req());
        let consumer = source.create_consumer(ContextId::from_str("play"));
        assert_eq!(source.consumer_count(), 1);
        drop(consumer);
        assert_eq!(source.consumer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_without_consumers_still_update_cache() {
        let source = registry().fetch_or_create(&req());
        source.on_publish(&req(), ContextId::from_str("pub1")).unwrap();
        source.on_frame(&video_sh()).unwrap();

        let consumer = source.create_consumer(ContextId::from_str("late"));
        let pkt = consumer
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(pkt.is_video_sequence_header());
    }

    #[test]
    fn registry_returns_same_source_for_same_url() {
        let registry = registry();
        let a = registry.fetch_or_create(&req());
        let b = registry.fetch_or_create(&req());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.find("example.com/live/livestream").is_some());
        assert!(registry.find("example.com/live/other").is_none());
    }
}
