//! The per-peer RTC connection: NACK emission and the PLI worker.
//!
//! The connection subscribes to the 20ms shared timer. Each tick it walks
//! its receive tracks, batches the sequences due for retransmission into
//! one compound RTCP NACK per track, and escalates abandoned sequences to
//! the PLI worker. The worker is a coroutine that batches keyframe
//! requests within a minimum interval so a burst of losses does not become
//! a PLI storm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::context::ContextId;
use crate::error::ServerResult;
use crate::rtc::track::{RecvTrack, SendTrack};
use crate::rtcp::{PictureLossIndication, TransportNack};
use crate::runtime::coroutine::{CoCond, Coroutine, CoroutineHandler, TaskSpawner};
use crate::runtime::timer::FastTimerHandler;

/// Where compound RTCP packets are written (the DTLS/SRTP transport in
/// production, a capture buffer in tests).
pub trait RtcpSink: Send + Sync {
    fn send_rtcp(&self, data: Bytes) -> ServerResult<()>;
}

struct PliInner {
    co: Arc<Coroutine>,
    cond: CoCond,
    queue: Mutex<Vec<u32>>,
    sink: Arc<dyn RtcpSink>,
    sender_ssrc: u32,
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

/// Batches keyframe requests into rate-limited PLI RTCP packets.
pub struct PliWorker {
    inner: Arc<PliInner>,
    started: AtomicBool,
}

impl PliWorker {
    /// Creates a stopped worker.
    pub fn new(
        cid: ContextId,
        sender_ssrc: u32,
        sink: Arc<dyn RtcpSink>,
        min_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PliInner {
                co: Coroutine::new("pli", cid),
                cond: CoCond::new(),
                queue: Mutex::new(Vec::new()),
                sink,
                sender_ssrc,
                min_interval,
                last_sent: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Starts the worker coroutine; idempotent.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .co
            .start(spawner, Arc::clone(&self.inner) as Arc<dyn CoroutineHandler>);
    }

    /// Stops the worker coroutine.
    pub fn stop(&self) {
        self.inner.co.stop();
    }

    /// Queues a keyframe request for the ssrc and wakes the worker.
    pub fn request_keyframe(&self, ssrc: u32, cid: ContextId) {
        log::debug!("[Pli] request keyframe ssrc={} cid={}", ssrc, cid);
        self.inner.queue.lock().push(ssrc);
        self.inner.cond.signal();
    }

    /// Queued (not yet sent) request count.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

#[async_trait]
impl CoroutineHandler for PliInner {
    async fn cycle(&self) -> ServerResult<()> {
        loop {
            self.co.pull()?;

            if self.queue.lock().is_empty() {
                self.co
                    .drive(async {
                        self.cond.wait().await;
                        Ok(())
                    })
                    .await?;
            }

            // Rate limit: space batches at least min_interval apart.
            let wait = {
                let last = self.last_sent.lock();
                last.map(|t| {
                    self.min_interval
                        .saturating_sub(Instant::now().duration_since(t))
                })
                .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                self.co.sleep(wait).await?;
            }

            let mut batch: Vec<u32> = std::mem::take(&mut *self.queue.lock());
            if batch.is_empty() {
                continue;
            }
            batch.sort_unstable();
            batch.dedup();

            for ssrc in batch {
                let pli = PictureLossIndication {
                    sender_ssrc: self.sender_ssrc,
                    media_ssrc: ssrc,
                };
                if let Err(err) = self.sink.send_rtcp(pli.marshal()) {
                    log::warn!("[Pli] send failed ssrc={}: {}", ssrc, err);
                }
            }
            *self.last_sent.lock() = Some(Instant::now());
        }
    }
}

/// One publisher-side RTC connection.
pub struct RtcConnection {
    cid: ContextId,
    sender_ssrc: u32,
    tracks: Mutex<Vec<Arc<RecvTrack>>>,
    sink: Arc<dyn RtcpSink>,
    pli: PliWorker,
    breaker: Arc<CircuitBreaker>,
}

impl RtcConnection {
    /// Creates a connection; subscribe it to the 20ms timer and start the
    /// PLI worker to activate loss recovery.
    pub fn new(
        cid: ContextId,
        sender_ssrc: u32,
        sink: Arc<dyn RtcpSink>,
        breaker: Arc<CircuitBreaker>,
        pli_min_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cid,
            sender_ssrc,
            tracks: Mutex::new(Vec::new()),
            sink: Arc::clone(&sink),
            pli: PliWorker::new(cid, sender_ssrc, sink, pli_min_interval),
            breaker,
        })
    }

    /// The connection's context id.
    pub fn cid(&self) -> ContextId {
        self.cid
    }

    /// Registers an inbound track.
    pub fn add_track(&self, track: Arc<RecvTrack>) {
        self.tracks.lock().push(track);
    }

    /// The PLI worker, for wiring and tests.
    pub fn pli_worker(&self) -> &PliWorker {
        &self.pli
    }

    /// Starts the PLI worker.
    pub fn start(&self, spawner: &dyn TaskSpawner) {
        self.pli.start(spawner);
    }

    /// Stops background work.
    pub fn stop(&self) {
        self.pli.stop();
    }

    fn scan_tracks(&self, now: Instant) -> ServerResult<()> {
        // Degrade voluntarily: no NACK generation under critical pressure.
        if self.breaker.critical_water_level() {
            return Ok(());
        }

        let tracks: Vec<Arc<RecvTrack>> = self.tracks.lock().clone();
        for track in tracks {
            let due = track.nacks_due(now);
            if !due.is_empty() {
                let nack = TransportNack::from_sequences(self.sender_ssrc, track.ssrc(), &due);
                if let Err(err) = self.sink.send_rtcp(nack.marshal()) {
                    log::warn!("[Rtc] nack send failed ssrc={}: {}", track.ssrc(), err);
                }
            }

            let abandoned = track.nacks_abandoned(now);
            if !abandoned.is_empty() {
                log::debug!(
                    "[Rtc] abandon {} seqs ssrc={}, asking for keyframe",
                    abandoned.len(),
                    track.ssrc()
                );
                self.pli.request_keyframe(track.ssrc(), self.cid);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FastTimerHandler for RtcConnection {
    async fn on_timer(&self, _interval: Duration) -> ServerResult<()> {
        self.scan_tracks(Instant::now())
    }
}

/// Where outbound (SRTP-bound) RTP packets are written.
pub trait RtpSink: Send + Sync {
    fn send_rtp(&self, data: Bytes) -> ServerResult<()>;
}

/// One player's downstream leg: pulls RTP off a source consumer and
/// re-stamps it onto this peer's send tracks.
pub struct RtcPlayStream {
    co: Arc<Coroutine>,
    consumer: Arc<crate::hub::rtc::RtcConsumer>,
    video: SendTrack,
    audio: SendTrack,
    sink: Arc<dyn RtpSink>,
    /// Payload types of the source's tracks.
    video_pt: u8,
    audio_pt: u8,
}

impl RtcPlayStream {
    pub fn new(
        cid: ContextId,
        consumer: Arc<crate::hub::rtc::RtcConsumer>,
        video: SendTrack,
        audio: SendTrack,
        sink: Arc<dyn RtpSink>,
        video_pt: u8,
        audio_pt: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            co: Coroutine::new("rtc-play", cid),
            consumer,
            video,
            audio,
            sink,
            video_pt,
            audio_pt,
        })
    }

    /// Starts the send loop.
    pub fn start(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        self.co
            .start(spawner, Arc::clone(self) as Arc<dyn CoroutineHandler>);
    }

    /// Stops the send loop.
    pub fn stop(&self) {
        self.co.stop();
    }

    /// Waits for the loop to exit (end-of-stream or stop).
    pub async fn join(&self) {
        self.co.join().await;
    }
}

#[async_trait]
impl CoroutineHandler for RtcPlayStream {
    async fn cycle(&self) -> ServerResult<()> {
        loop {
            self.co.pull()?;
            match self
                .co
                .drive(self.consumer.dequeue(Duration::from_millis(1000)))
                .await
            {
                Ok(Some(pkt)) => {
                    let track = if pkt.header.payload_type == self.video_pt {
                        &self.video
                    } else if pkt.header.payload_type == self.audio_pt {
                        &self.audio
                    } else {
                        continue;
                    };
                    let out = track.packetize(
                        pkt.header.timestamp,
                        pkt.header.marker,
                        pkt.payload.clone(),
                    );
                    if let Err(err) = self.sink.send_rtp(out.marshal()) {
                        log::warn!("[RtcPlay] send cid={}: {}", self.co.cid(), err);
                    }
                }
                Ok(None) => {
                    log::info!("[RtcPlay] stream ended cid={}", self.co.cid());
                    return Ok(());
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(err.wrap("rtc play")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker, CpuSource};
    use crate::bridge::RtpTarget;
    use crate::rtc::track::TrackKind;
    use crate::rtp::nack::NackOptions;
    use crate::rtp::{RtpHeader, RtpPacket};
    use crate::runtime::coroutine::TokioSpawner;

    struct Probe {
        sent: Mutex<Vec<Bytes>>,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl RtcpSink for Probe {
        fn send_rtcp(&self, data: Bytes) -> ServerResult<()> {
            self.sent.lock().push(data);
            Ok(())
        }
    }

    struct IdleCpu;

    impl CpuSource for IdleCpu {
        fn cpu_percent(&self) -> f32 {
            0.0
        }
    }

    fn breaker(enabled: bool) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            BreakerConfig {
                enabled,
                ..Default::default()
            },
            Arc::new(IdleCpu),
        )
    }

    fn rtp(seq: u16) -> Arc<RtpPacket> {
        Arc::new(RtpPacket {
            header: RtpHeader {
                sequence_number: seq,
                ssrc: 7,
                payload_type: 102,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x41]),
        })
    }

    fn nack_opts() -> NackOptions {
        NackOptions {
            max_retries: 2,
            first_interval: Duration::ZERO,
            retry_interval: Duration::from_millis(20),
            max_age: Duration::from_secs(5),
            window: 512,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_sequence_is_nacked_then_escalated_to_pli() {
        let probe = Probe::new();
        let conn = RtcConnection::new(
            ContextId::from_str("rtc1"),
            1,
            Arc::clone(&probe) as Arc<dyn RtcpSink>,
            breaker(true),
            Duration::from_millis(50),
        );
        conn.start(&TokioSpawner::current());

        let track = RecvTrack::new(7, TrackKind::Video, nack_opts(), 512);
        conn.add_track(Arc::clone(&track));

        // 102 never arrives.
        let now = Instant::now();
        for seq in [100u16, 101, 103, 104] {
            track.on_rtp(&rtp(seq), now);
        }

        // First tick: a NACK naming 102.
        conn.on_timer(Duration::from_millis(20)).await.unwrap();
        {
            let sent = probe.sent.lock();
            assert_eq!(sent.len(), 1);
            let nack = TransportNack::unmarshal(&sent[0]).unwrap();
            assert_eq!(nack.media_ssrc, 7);
            assert_eq!(nack.sequences(), vec![102]);
        }

        // Retry, then exhaustion triggers the PLI path.
        tokio::time::advance(Duration::from_millis(20)).await;
        conn.on_timer(Duration::from_millis(20)).await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        conn.on_timer(Duration::from_millis(20)).await.unwrap();

        // Let the PLI worker drain its queue.
        tokio::time::sleep(Duration::from_millis(120)).await;

        let sent = probe.sent.lock();
        let pli = sent
            .iter()
            .filter_map(|b| PictureLossIndication::unmarshal(b).ok())
            .next()
            .expect("a PLI should have been emitted");
        assert_eq!(pli.media_ssrc, 7);
        conn.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn pli_worker_batches_within_min_interval() {
        let probe = Probe::new();
        let worker = PliWorker::new(
            ContextId::from_str("rtc1"),
            1,
            Arc::clone(&probe) as Arc<dyn RtcpSink>,
            Duration::from_millis(100),
        );
        worker.start(&TokioSpawner::current());
        // Idempotent start.
        worker.start(&TokioSpawner::current());

        for _ in 0..5 {
            worker.request_keyframe(7, ContextId::from_str("play"));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Five requests for the same ssrc collapse into one PLI.
        assert_eq!(probe.sent.lock().len(), 1);

        // A follow-up burst waits out the minimum interval.
        worker.request_keyframe(7, ContextId::from_str("play"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.sent.lock().len(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(probe.sent.lock().len(), 2);
        worker.stop();
    }

    struct RtpProbe {
        sent: Mutex<Vec<Bytes>>,
    }

    impl RtpSink for RtpProbe {
        fn send_rtp(&self, data: Bytes) -> ServerResult<()> {
            self.sent.lock().push(data);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn play_stream_restamps_onto_send_tracks() {
        use crate::hub::live::ConsumerBounds;
        use crate::hub::{rtc::RtcSourceRegistry, SourceEvents};
        use crate::request::StreamRequest;
        use crate::rtp::packet::RtpPacket as Pkt;

        let registry = RtcSourceRegistry::new(ConsumerBounds::default(), SourceEvents::new());
        let req = StreamRequest::new("rtc", "h", "live", "x", 8000);
        let source = registry.fetch_or_create(&req);
        source.on_publish(&req, ContextId::from_str("pub1")).unwrap();
        let consumer = source.create_consumer(ContextId::from_str("play"));

        let probe = Arc::new(RtpProbe {
            sent: Mutex::new(Vec::new()),
        });
        let play = RtcPlayStream::new(
            ContextId::from_str("play"),
            consumer,
            SendTrack::new(0x100, 102, crate::rtc::track::TrackKind::Video),
            SendTrack::new(0x101, 111, crate::rtc::track::TrackKind::Audio),
            probe.clone() as Arc<dyn RtpSink>,
            102,
            111,
        );
        play.start(&TokioSpawner::current());

        // Publisher-side packets with arbitrary sequences; audio unmarked.
        for (pt, seq, marker) in [(102u8, 7000u16, true), (111, 123, false)] {
            let pkt = Arc::new(Pkt {
                header: crate::rtp::RtpHeader {
                    marker,
                    payload_type: pt,
                    sequence_number: seq,
                    timestamp: 9000,
                    ssrc: 0xabc,
                    ..Default::default()
                },
                payload: Bytes::from_static(&[1, 2, 3]),
            });
            source.on_rtp(&pkt).unwrap();
        }
        source.on_unpublish();
        play.join().await;

        let sent = probe.sent.lock();
        assert_eq!(sent.len(), 2);

        let video = Pkt::unmarshal(&sent[0]).unwrap();
        // Re-stamped into this peer's sequence space and ssrc.
        assert_eq!(video.header.sequence_number, 0);
        assert_eq!(video.header.ssrc, 0x100);
        assert!(video.header.marker);

        let audio = Pkt::unmarshal(&sent[1]).unwrap();
        assert_eq!(audio.header.ssrc, 0x101);
        // Audio closes its frame on every packet.
        assert!(audio.header.marker);
        assert_eq!(audio.payload.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_pressure_disables_nack_generation() {
        struct BusyCpu;
        impl CpuSource for BusyCpu {
            fn cpu_percent(&self) -> f32 {
                100.0
            }
        }
        let breaker = CircuitBreaker::new(BreakerConfig::default(), Arc::new(BusyCpu));
        // Drive the breaker into critical.
        breaker.on_timer(Duration::from_secs(1)).await.unwrap();
        assert!(breaker.critical_water_level());

        let probe = Probe::new();
        let conn = RtcConnection::new(
            ContextId::from_str("rtc1"),
            1,
            Arc::clone(&probe) as Arc<dyn RtcpSink>,
            breaker,
            Duration::from_millis(50),
        );
        let track = RecvTrack::new(7, TrackKind::Video, nack_opts(), 512);
        conn.add_track(Arc::clone(&track));

        let now = Instant::now();
        for seq in [100u16, 102] {
            track.on_rtp(&rtp(seq), now);
        }
        conn.on_timer(Duration::from_millis(20)).await.unwrap();
        assert!(probe.sent.lock().is_empty());
    }
}
