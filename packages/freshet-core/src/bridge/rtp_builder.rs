//! Frame to RTP packetization (RFC 6184 for video).
//!
//! Video frames are split into NALUs: a sequence header becomes one STAP-A
//! aggregating SPS and PPS, a NALU over the MTU becomes a FU-A run, and
//! anything else a single-NAL packet. Sequence numbers advance monotonically
//! per track and the marker bit tags the last packet of each frame. Audio is
//! repacketized one frame per packet; when the source codec differs from
//! the target's preferred codec the frames pass through unchanged.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::breaker::CircuitBreaker;
use crate::bridge::{FrameTarget, RtpTarget, StreamBridge};
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::rtc::RtcSource;
use crate::packet::MediaPacket;
use crate::request::StreamRequest;
use crate::rtp::h264::{avcc_split, parse_decoder_configuration, NALU_TYPE_FU_A, NALU_TYPE_STAP_A};
use crate::rtp::{RtpHeader, RtpPacket};

/// Packetizer tuning.
#[derive(Debug, Clone, Copy)]
pub struct RtpBuilderConfig {
    /// Maximum RTP payload size before fragmenting.
    pub mtu: usize,
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
    /// RTP clock units per millisecond for video (90 kHz).
    pub video_units_per_ms: u32,
    /// RTP clock units per millisecond for audio (48 kHz).
    pub audio_units_per_ms: u32,
}

impl Default for RtpBuilderConfig {
    fn default() -> Self {
        Self {
            mtu: 1200,
            video_payload_type: 102,
            audio_payload_type: 111,
            video_ssrc: 0,
            audio_ssrc: 0,
            video_units_per_ms: 90,
            audio_units_per_ms: 48,
        }
    }
}

#[derive(Default)]
struct TrackSeq {
    video: u16,
    audio: u16,
}

/// Converts shared media frames into RTP packets for an [`RtpTarget`].
pub struct RtpBuilder {
    target: Arc<dyn RtpTarget>,
    cfg: RtpBuilderConfig,
    seq: Mutex<TrackSeq>,
}

impl RtpBuilder {
    /// Creates a builder feeding the given target.
    pub fn new(target: Arc<dyn RtpTarget>, cfg: RtpBuilderConfig) -> Self {
        Self {
            target,
            cfg,
            seq: Mutex::new(TrackSeq::default()),
        }
    }

    fn next_video_seq(&self) -> u16 {
        let mut seq = self.seq.lock();
        let s = seq.video;
        seq.video = seq.video.wrapping_add(1);
        s
    }

    fn next_audio_seq(&self) -> u16 {
        let mut seq = self.seq.lock();
        let s = seq.audio;
        seq.audio = seq.audio.wrapping_add(1);
        s
    }

    fn send_video(&self, ts_ms: i64, marker: bool, payload: Bytes) -> ServerResult<()> {
        let pkt = Arc::new(RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: self.cfg.video_payload_type,
                sequence_number: self.next_video_seq(),
                timestamp: (ts_ms as u32).wrapping_mul(self.cfg.video_units_per_ms),
                ssrc: self.cfg.video_ssrc,
                ..Default::default()
            },
            payload,
        });
        self.target.on_rtp(&pkt)
    }

    fn package_stap_a(&self, frame: &MediaPacket) -> ServerResult<()> {
        let config = frame.payload.slice(5..);
        let (sps, pps) = parse_decoder_configuration(&config)?;

        let mut payload = BytesMut::with_capacity(5 + sps.len() + pps.len());
        payload.put_u8((sps[0] & 0x60) | NALU_TYPE_STAP_A);
        payload.put_u16(sps.len() as u16);
        payload.put_slice(&sps);
        payload.put_u16(pps.len() as u16);
        payload.put_slice(&pps);

        self.send_video(frame.timestamp, true, payload.freeze())
    }

    fn package_nalus(&self, frame: &MediaPacket) -> ServerResult<()> {
        let avcc = frame.payload.slice(5..);
        let nalus = avcc_split(&avcc, 4)?;
        if nalus.is_empty() {
            return Ok(());
        }

        let last = nalus.len() - 1;
        for (i, nalu) in nalus.iter().enumerate() {
            let frame_end = i == last;
            if nalu.len() <= self.cfg.mtu {
                self.send_video(frame.timestamp, frame_end, nalu.clone())?;
            } else {
                self.package_fu_a(frame.timestamp, nalu, frame_end)?;
            }
        }
        Ok(())
    }

    fn package_fu_a(&self, ts_ms: i64, nalu: &Bytes, frame_end: bool) -> ServerResult<()> {
        let indicator = (nalu[0] & 0xe0) | NALU_TYPE_FU_A;
        let nalu_type = nalu[0] & 0x1f;
        let body = nalu.slice(1..);

        let chunk_size = self.cfg.mtu - 2;
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(chunk_size)
            .map(|off| body.slice(off..(off + chunk_size).min(body.len())))
            .collect();

        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut fu_header = nalu_type;
            if i == 0 {
                fu_header |= 0x80; // S
            }
            if i == last {
                fu_header |= 0x40; // E
            }
            let mut payload = BytesMut::with_capacity(2 + chunk.len());
            payload.put_u8(indicator);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);

            self.send_video(ts_ms, frame_end && i == last, payload.freeze())?;
        }
        Ok(())
    }

    fn package_audio(&self, frame: &MediaPacket) -> ServerResult<()> {
        // The decoder config has no place on the wire; players learn the
        // codec out of band.
        if frame.is_audio_sequence_header() {
            return Ok(());
        }
        let header_len = if frame.payload.len() >= 2 && (frame.payload[0] >> 4) == 10 {
            2
        } else {
            1
        };
        if frame.payload.len() <= header_len {
            return Ok(());
        }

        let pkt = Arc::new(RtpPacket {
            header: RtpHeader {
                // Every audio packet closes its frame.
                marker: true,
                payload_type: self.cfg.audio_payload_type,
                sequence_number: self.next_audio_seq(),
                timestamp: (frame.timestamp as u32).wrapping_mul(self.cfg.audio_units_per_ms),
                ssrc: self.cfg.audio_ssrc,
                ..Default::default()
            },
            payload: frame.payload.slice(header_len..),
        });
        self.target.on_rtp(&pkt)
    }
}

impl FrameTarget for RtpBuilder {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        let result = match () {
            _ if frame.is_metadata() => Ok(()),
            _ if frame.is_audio() => self.package_audio(frame),
            _ if frame.is_video_sequence_header() => self.package_stap_a(frame),
            _ if frame.is_video() => {
                if frame.payload.len() < 5 {
                    Err(ServerError::Protocol("video payload too short".into()))
                } else {
                    self.package_nalus(frame)
                }
            }
            _ => Ok(()),
        };

        // Malformed payloads are logged and dropped; only target failures
        // reach the publisher.
        match result {
            Err(err @ ServerError::Protocol(_)) => {
                log::warn!("[RtpBuilder] drop frame ts={}: {}", frame.timestamp, err);
                Ok(())
            }
            other => other,
        }
    }
}

/// Frame-domain bridge delivering a publisher's frames to an RTC source.
///
/// Cross-domain repacketization is the first work shed under extreme CPU
/// pressure: at the dying water level frames are dropped here while the
/// publisher's own consumers keep flowing.
pub struct FrameToRtcBridge {
    builder: RtpBuilder,
    rtc: Arc<RtcSource>,
    cid: ContextId,
    req: Mutex<Option<StreamRequest>>,
    breaker: Arc<CircuitBreaker>,
}

impl FrameToRtcBridge {
    /// Creates the bridge with fresh random ssrcs.
    pub fn new(
        rtc: Arc<RtcSource>,
        cid: ContextId,
        cfg: RtpBuilderConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            builder: RtpBuilder::new(Arc::clone(&rtc) as Arc<dyn RtpTarget>, cfg),
            rtc,
            cid,
            req: Mutex::new(None),
            breaker,
        })
    }
}

impl FrameTarget for FrameToRtcBridge {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        if self.breaker.dying_water_level() {
            log::debug!("[RtpBridge] shed frame ts={} cid={}", frame.timestamp, self.cid);
            return Ok(());
        }
        self.builder.on_frame(frame)
    }
}

impl StreamBridge for FrameToRtcBridge {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()> {
        *self.req.lock() = Some(req.clone());
        Ok(())
    }

    fn on_publish(&self) -> ServerResult<()> {
        let req = self
            .req
            .lock()
            .clone()
            .ok_or_else(|| ServerError::Internal("bridge publish before initialize".into()))?;
        self.rtc.on_publish(&req, self.cid)
    }

    fn on_unpublish(&self) {
        self.rtc.on_unpublish();
    }
}

/// Frame-domain bridge delivering frames straight to a live source.
pub struct FrameToLiveBridge {
    live: Arc<crate::hub::live::LiveSource>,
    cid: ContextId,
    req: Mutex<Option<StreamRequest>>,
}

impl FrameToLiveBridge {
    pub fn new(live: Arc<crate::hub::live::LiveSource>, cid: ContextId) -> Arc<Self> {
        Arc::new(Self {
            live,
            cid,
            req: Mutex::new(None),
        })
    }
}

impl FrameTarget for FrameToLiveBridge {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        self.live.on_frame(frame)
    }
}

impl StreamBridge for FrameToLiveBridge {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()> {
        *self.req.lock() = Some(req.clone());
        Ok(())
    }

    fn on_publish(&self) -> ServerResult<()> {
        let req = self
            .req
            .lock()
            .clone()
            .ok_or_else(|| ServerError::Internal("bridge publish before initialize".into()))?;
        self.live.on_publish(&req, self.cid)
    }

    fn on_unpublish(&self) {
        self.live.on_unpublish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{avc_frame_payload, avc_sequence_header_payload, PacketKind};
    use crate::rtp::h264::{avc_decoder_configuration, avcc_join, nalu_type};

    struct Sink {
        packets: Mutex<Vec<RtpPacket>>,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(Vec::new()),
            })
        }
    }

    impl RtpTarget for Sink {
        fn on_rtp(&self, pkt: &Arc<RtpPacket>) -> ServerResult<()> {
            self.packets.lock().push((**pkt).clone());
            Ok(())
        }
    }

    fn builder(sink: &Arc<Sink>) -> RtpBuilder {
        RtpBuilder::new(Arc::clone(sink) as Arc<dyn RtpTarget>, RtpBuilderConfig::default())
    }

    #[test]
    fn sequence_header_becomes_one_stap_a() {
        let sink = Sink::new();
        let b = builder(&sink);

        let sps: Vec<u8> = std::iter::once(0x67).chain((0..15).map(|i| i as u8)).collect();
        let pps: Vec<u8> = std::iter::once(0x68).chain((0..7).map(|i| i as u8)).collect();
        let config = avc_decoder_configuration(&sps, &pps).unwrap();
        let frame = MediaPacket::new(PacketKind::Video, 0, avc_sequence_header_payload(&config));

        b.on_frame(&frame).unwrap();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        let pkt = &packets[0];
        assert_eq!(nalu_type(pkt.payload[0]), NALU_TYPE_STAP_A);
        assert!(pkt.header.marker);
        assert_eq!(pkt.header.sequence_number, 0);

        // Length-prefixed SPS then PPS.
        let sps_len = u16::from_be_bytes([pkt.payload[1], pkt.payload[2]]) as usize;
        assert_eq!(sps_len, 16);
        assert_eq!(&pkt.payload[3..3 + sps_len], &sps[..]);
        let off = 3 + sps_len;
        let pps_len = u16::from_be_bytes([pkt.payload[off], pkt.payload[off + 1]]) as usize;
        assert_eq!(pps_len, 8);
        assert_eq!(&pkt.payload[off + 2..off + 2 + pps_len], &pps[..]);

        // Track sequence advanced by exactly one.
        let frame2 = MediaPacket::new(
            PacketKind::Video,
            40,
            avc_frame_payload(true, 0, &avcc_join(&[Bytes::from_static(&[0x65, 1])])),
        );
        b.on_frame(&frame2).unwrap();
        assert_eq!(sink.packets.lock()[1].header.sequence_number, 1);
    }

    #[test]
    fn small_nalu_is_single_packet_with_marker() {
        let sink = Sink::new();
        let b = builder(&sink);

        let nalu = Bytes::from_static(&[0x65, 0xaa, 0xbb]);
        let frame = MediaPacket::new(
            PacketKind::Video,
            40,
            avc_frame_payload(true, 0, &avcc_join(&[nalu.clone()])),
        );
        b.on_frame(&frame).unwrap();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, nalu);
        assert!(packets[0].header.marker);
        // 90 kHz clock.
        assert_eq!(packets[0].header.timestamp, 40 * 90);
    }

    #[test]
    fn oversized_nalu_is_fragmented_into_fu_a() {
        let sink = Sink::new();
        let b = builder(&sink);

        let mut nalu = vec![0x65u8];
        nalu.extend(std::iter::repeat(0xab).take(3000));
        let frame = MediaPacket::new(
            PacketKind::Video,
            40,
            avc_frame_payload(true, 0, &avcc_join(&[Bytes::from(nalu.clone())])),
        );
        b.on_frame(&frame).unwrap();

        let packets = sink.packets.lock();
        assert!(packets.len() >= 3);

        for (i, pkt) in packets.iter().enumerate() {
            assert_eq!(nalu_type(pkt.payload[0]), NALU_TYPE_FU_A);
            let fu = pkt.payload[1];
            assert_eq!(fu & 0x1f, 5, "fragment carries the NALU type");
            assert_eq!(fu & 0x80 != 0, i == 0, "S bit only on the first");
            assert_eq!(fu & 0x40 != 0, i == packets.len() - 1, "E bit only on the last");
            assert_eq!(pkt.header.marker, i == packets.len() - 1);
            assert_eq!(pkt.header.sequence_number, i as u16);
        }

        // Reassembled fragments equal the original NALU body.
        let mut body = Vec::new();
        for pkt in packets.iter() {
            body.extend_from_slice(&pkt.payload[2..]);
        }
        assert_eq!(body, nalu[1..]);
    }

    #[test]
    fn audio_frames_pass_through_with_marker() {
        let sink = Sink::new();
        let b = builder(&sink);

        let frame = MediaPacket::new(
            PacketKind::Audio,
            20,
            crate::packet::aac_frame_payload(&[0x11, 0x22, 0x33]),
        );
        b.on_frame(&frame).unwrap();

        let packets = sink.packets.lock();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.marker);
        assert_eq!(packets[0].payload.as_ref(), &[0x11, 0x22, 0x33]);
        assert_eq!(packets[0].header.timestamp, 20 * 48);
    }

    #[test]
    fn audio_sequence_header_is_skipped() {
        let sink = Sink::new();
        let b = builder(&sink);
        let frame = MediaPacket::new(
            PacketKind::Audio,
            0,
            crate::packet::aac_sequence_header_payload(&[0x12, 0x10]),
        );
        b.on_frame(&frame).unwrap();
        assert!(sink.packets.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dying_pressure_sheds_cross_domain_forwarding() {
        use crate::breaker::{BreakerConfig, CpuSource};
        use crate::hub::live::ConsumerBounds;
        use crate::hub::{rtc::RtcSourceRegistry, SourceEvents};
        use crate::request::StreamRequest;
        use crate::runtime::timer::FastTimerHandler;
        use std::time::Duration;

        struct Dial {
            cpu: Mutex<f32>,
        }

        impl CpuSource for Dial {
            fn cpu_percent(&self) -> f32 {
                *self.cpu.lock()
            }
        }

        let cpu = Arc::new(Dial {
            cpu: Mutex::new(100.0),
        });
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                dying_pulse: 1,
                ..Default::default()
            },
            Arc::clone(&cpu) as Arc<dyn CpuSource>,
        );

        let registry = RtcSourceRegistry::new(ConsumerBounds::default(), SourceEvents::new());
        let req = StreamRequest::new("rtmp", "h", "live", "x", 1935);
        let rtc = registry.fetch_or_create(&req);
        let bridge = FrameToRtcBridge::new(
            Arc::clone(&rtc),
            crate::context::ContextId::from_str("pub1"),
            RtpBuilderConfig::default(),
            Arc::clone(&breaker),
        );
        bridge.initialize(&req).unwrap();
        bridge.on_publish().unwrap();
        let consumer = rtc.create_consumer(crate::context::ContextId::from_str("play"));

        let frame = MediaPacket::new(
            PacketKind::Video,
            40,
            avc_frame_payload(true, 0, &avcc_join(&[Bytes::from_static(&[0x65, 1])])),
        );

        // One hot tick reaches the dying level: frames are shed, so the
        // RTC consumer behind this bridge sees nothing.
        breaker.on_timer(Duration::from_secs(1)).await.unwrap();
        assert!(breaker.dying_water_level());
        bridge.on_frame(&frame).unwrap();
        let starved = consumer.dequeue(Duration::from_millis(10)).await;
        assert!(starved.unwrap_err().is_timeout());

        // Pressure gone: forwarding resumes.
        *cpu.cpu.lock() = 10.0;
        breaker.on_timer(Duration::from_secs(1)).await.unwrap();
        assert!(!breaker.dying_water_level());
        bridge.on_frame(&frame).unwrap();
        let pkt = consumer
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.payload.as_ref(), &[0x65, 1]);
    }

    #[test]
    fn malformed_video_is_dropped_not_fatal() {
        let sink = Sink::new();
        let b = builder(&sink);
        let frame = MediaPacket::new(PacketKind::Video, 40, Bytes::from_static(&[0x17]));
        // Logged and swallowed.
        b.on_frame(&frame).unwrap();
        assert!(sink.packets.lock().is_empty());
    }
}
