//! RTP to frame reassembly.
//!
//! Rebuilds AV frames from a WebRTC publisher's RTP: FU-A fragments are
//! stitched back together keyed on sequence contiguity, STAP-A aggregates
//! are unpacked into SPS/PPS, and complete NALUs buffer until the marker
//! closes the frame. A sequence gap inside a fragmented frame drops the
//! frame and asks the publisher for a fresh keyframe.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::bridge::{FrameTarget, RtpBridge, RtpTarget};
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::live::LiveSource;
use crate::hub::rtc::RtcSource;
use crate::packet::{
    aac_frame_payload, avc_frame_payload, avc_sequence_header_payload, MediaPacket, PacketKind,
};
use crate::request::StreamRequest;
use crate::rtp::h264::{
    avc_decoder_configuration, avcc_join, nalu_type, NaluKind, FU_END, FU_START, NALU_TYPE_FU_A,
    NALU_TYPE_STAP_A,
};
use crate::rtp::RtpPacket;

/// Builder tuning: which payload types map to which track.
#[derive(Debug, Clone, Copy)]
pub struct FrameBuilderConfig {
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
    pub video_units_per_ms: u32,
    pub audio_units_per_ms: u32,
}

impl Default for FrameBuilderConfig {
    fn default() -> Self {
        Self {
            video_payload_type: 102,
            audio_payload_type: 111,
            video_units_per_ms: 90,
            audio_units_per_ms: 48,
        }
    }
}

#[derive(Default)]
struct BuildState {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    header_dirty: bool,
    /// NALUs of the frame being accumulated until the marker.
    frame_nalus: Vec<Bytes>,
    frame_has_idr: bool,
    /// FU-A accumulation.
    fu_body: Option<BytesMut>,
    expected_seq: Option<u16>,
    /// Dropping the rest of a torn frame until the next start.
    dropping: bool,
}

/// Reassembles RTP into media frames for a [`FrameTarget`].
pub struct FrameBuilder {
    target: Arc<dyn FrameTarget>,
    source: Mutex<Option<Weak<RtcSource>>>,
    cfg: FrameBuilderConfig,
    state: Mutex<BuildState>,
    cid: ContextId,
}

impl FrameBuilder {
    /// Creates a builder feeding the given target.
    pub fn new(target: Arc<dyn FrameTarget>, cfg: FrameBuilderConfig, cid: ContextId) -> Self {
        Self {
            target,
            source: Mutex::new(None),
            cfg,
            state: Mutex::new(BuildState::default()),
            cid,
        }
    }

    /// Attaches the source used for keyframe recovery.
    pub fn set_source(&self, source: Weak<RtcSource>) {
        *self.source.lock() = Some(source);
    }

    fn request_keyframe(&self, ssrc: u32) {
        let source = self.source.lock().clone();
        if let Some(source) = source.and_then(|w| w.upgrade()) {
            source.request_keyframe(ssrc, self.cid);
        }
    }

    fn cache_parameter_set(state: &mut BuildState, nalu: &Bytes) {
        match NaluKind::of(nalu[0]) {
            NaluKind::Sps => {
                if state.sps.as_ref() != Some(nalu) {
                    state.sps = Some(nalu.clone());
                    state.header_dirty = true;
                }
            }
            NaluKind::Pps => {
                if state.pps.as_ref() != Some(nalu) {
                    state.pps = Some(nalu.clone());
                    state.header_dirty = true;
                }
            }
            _ => {}
        }
    }

    fn push_nalu(state: &mut BuildState, nalu: Bytes) {
        if nalu.is_empty() {
            return;
        }
        Self::cache_parameter_set(state, &nalu);
        match NaluKind::of(nalu[0]) {
            NaluKind::Sps | NaluKind::Pps | NaluKind::AccessUnitDelimiter => {}
            kind => {
                if kind == NaluKind::Idr {
                    state.frame_has_idr = true;
                }
                state.frame_nalus.push(nalu);
            }
        }
    }

    fn on_video(&self, pkt: &RtpPacket) -> ServerResult<()> {
        if pkt.payload.is_empty() {
            return Ok(());
        }
        let seq = pkt.header.sequence_number;
        let mut state = self.state.lock();

        // Contiguity check: a hole inside a fragmented frame tears it.
        if let Some(expected) = state.expected_seq {
            if seq != expected && state.fu_body.is_some() {
                log::warn!(
                    "[FrameBuilder] seq gap {} != {}, dropping fragmented frame",
                    seq,
                    expected
                );
                state.fu_body = None;
                state.frame_nalus.clear();
                state.frame_has_idr = false;
                state.dropping = true;
                drop(state);
                self.request_keyframe(pkt.header.ssrc);
                return Ok(());
            }
        }
        state.expected_seq = Some(seq.wrapping_add(1));

        match nalu_type(pkt.payload[0]) {
            NALU_TYPE_STAP_A => {
                let mut offset = 1usize;
                while offset + 2 <= pkt.payload.len() {
                    let len = u16::from_be_bytes([pkt.payload[offset], pkt.payload[offset + 1]])
                        as usize;
                    offset += 2;
                    if offset + len > pkt.payload.len() {
                        return Err(ServerError::Protocol("stap-a overrun".into()));
                    }
                    let nalu = pkt.payload.slice(offset..offset + len);
                    offset += len;
                    Self::push_nalu(&mut state, nalu);
                }
            }
            NALU_TYPE_FU_A => {
                if pkt.payload.len() < 2 {
                    return Err(ServerError::Protocol("fu-a too short".into()));
                }
                let fu = pkt.payload[1];
                if fu & FU_START != 0 {
                    state.dropping = false;
                    let header = (pkt.payload[0] & 0xe0) | (fu & 0x1f);
                    let mut body = BytesMut::new();
                    body.extend_from_slice(&[header]);
                    body.extend_from_slice(&pkt.payload[2..]);
                    state.fu_body = Some(body);
                } else if let Some(body) = state.fu_body.as_mut() {
                    body.extend_from_slice(&pkt.payload[2..]);
                } else if !state.dropping {
                    // Mid-fragment without a start: the frame is torn.
                    state.dropping = true;
                    drop(state);
                    self.request_keyframe(pkt.header.ssrc);
                    return Ok(());
                }

                if fu & FU_END != 0 {
                    if let Some(body) = state.fu_body.take() {
                        Self::push_nalu(&mut state, body.freeze());
                    }
                }
            }
            _ => {
                state.dropping = false;
                Self::push_nalu(&mut state, pkt.payload.clone());
            }
        }

        if pkt.header.marker {
            return self.flush_frame(&mut state, pkt.header.timestamp);
        }
        Ok(())
    }

    fn flush_frame(
        &self,
        state: &mut parking_lot::MutexGuard<'_, BuildState>,
        rtp_ts: u32,
    ) -> ServerResult<()> {
        let ts_ms = (rtp_ts / self.cfg.video_units_per_ms) as i64;

        // A refreshed SPS/PPS pair becomes a sequence header ahead of the
        // frame that uses it.
        if state.header_dirty {
            if let (Some(sps), Some(pps)) = (state.sps.clone(), state.pps.clone()) {
                let config = avc_decoder_configuration(&sps, &pps)?;
                let header =
                    MediaPacket::new(PacketKind::Video, ts_ms, avc_sequence_header_payload(&config));
                self.target.on_frame(&header)?;
                state.header_dirty = false;
            }
        }

        if state.frame_nalus.is_empty() {
            return Ok(());
        }
        let nalus = std::mem::take(&mut state.frame_nalus);
        let keyframe = std::mem::take(&mut state.frame_has_idr);

        let frame = MediaPacket::new(
            PacketKind::Video,
            ts_ms,
            avc_frame_payload(keyframe, 0, &avcc_join(&nalus)),
        );
        self.target.on_frame(&frame)
    }

    fn on_audio(&self, pkt: &RtpPacket) -> ServerResult<()> {
        if pkt.payload.is_empty() {
            return Ok(());
        }
        let ts_ms = (pkt.header.timestamp / self.cfg.audio_units_per_ms) as i64;
        let frame = MediaPacket::new(PacketKind::Audio, ts_ms, aac_frame_payload(&pkt.payload));
        self.target.on_frame(&frame)
    }
}

impl RtpTarget for FrameBuilder {
    fn on_rtp(&self, pkt: &Arc<RtpPacket>) -> ServerResult<()> {
        let result = if pkt.header.payload_type == self.cfg.video_payload_type {
            self.on_video(pkt)
        } else if pkt.header.payload_type == self.cfg.audio_payload_type {
            self.on_audio(pkt)
        } else {
            Ok(())
        };

        match result {
            Err(err @ ServerError::Protocol(_)) => {
                log::warn!(
                    "[FrameBuilder] drop rtp seq={}: {}",
                    pkt.header.sequence_number,
                    err
                );
                Ok(())
            }
            other => other,
        }
    }
}

/// RTP-domain bridge delivering an RTC publisher's stream to a live source.
pub struct RtcToLiveBridge {
    builder: FrameBuilder,
    live: Arc<LiveSource>,
    cid: ContextId,
    req: Mutex<Option<StreamRequest>>,
}

impl RtcToLiveBridge {
    pub fn new(live: Arc<LiveSource>, cid: ContextId, cfg: FrameBuilderConfig) -> Arc<Self> {
        Arc::new(Self {
            builder: FrameBuilder::new(Arc::clone(&live) as Arc<dyn FrameTarget>, cfg, cid),
            live,
            cid,
            req: Mutex::new(None),
        })
    }

    /// Attaches the RTC source for keyframe recovery.
    pub fn set_source(&self, source: Weak<RtcSource>) {
        self.builder.set_source(source);
    }
}

impl RtpTarget for RtcToLiveBridge {
    fn on_rtp(&self, pkt: &Arc<RtpPacket>) -> ServerResult<()> {
        self.builder.on_rtp(pkt)
    }
}

impl RtpBridge for RtcToLiveBridge {
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
    use crate::rtp::RtpHeader;

    struct Sink {
        frames: Mutex<Vec<Arc<MediaPacket>>>,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl FrameTarget for Sink {
        fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
            self.frames.lock().push(Arc::clone(frame));
            Ok(())
        }
    }

    fn builder(sink: &Arc<Sink>) -> FrameBuilder {
        FrameBuilder::new(
            Arc::clone(sink) as Arc<dyn FrameTarget>,
            FrameBuilderConfig::default(),
            ContextId::from_str("test"),
        )
    }

    fn video(seq: u16, ts: u32, marker: bool, payload: Vec<u8>) -> Arc<RtpPacket> {
        Arc::new(RtpPacket {
            header: RtpHeader {
                marker,
                payload_type: 102,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 7,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        })
    }

    #[test]
    fn stap_a_then_idr_yields_header_and_keyframe() {
        let sink = Sink::new();
        let b = builder(&sink);

        // STAP-A carrying SPS(5B) + PPS(3B).
        let sps = [0x67, 0x64, 0x00, 0x1f, 0xac];
        let pps = [0x68, 0xeb, 0xec];
        let mut stap = vec![NALU_TYPE_STAP_A];
        stap.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        stap.extend_from_slice(&sps);
        stap.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        stap.extend_from_slice(&pps);
        b.on_rtp(&video(100, 3600, false, stap)).unwrap();

        // Single-NAL IDR closing the frame.
        b.on_rtp(&video(101, 3600, true, vec![0x65, 0x11, 0x22])).unwrap();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_video_sequence_header());
        assert_eq!(frames[0].timestamp, 40);
        assert!(frames[1].is_keyframe());
        assert_eq!(frames[1].timestamp, 40);
    }

    #[test]
    fn fu_a_fragments_reassemble() {
        let sink = Sink::new();
        let b = builder(&sink);

        // NALU 0x65 + 6 body bytes split across three fragments.
        let indicator = 0x60 | NALU_TYPE_FU_A;
        b.on_rtp(&video(1, 900, false, vec![indicator, FU_START | 5, 1, 2])).unwrap();
        b.on_rtp(&video(2, 900, false, vec![indicator, 5, 3, 4])).unwrap();
        b.on_rtp(&video(3, 900, true, vec![indicator, FU_END | 5, 5, 6])).unwrap();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert!(frame.is_keyframe());
        // FLV header (5B) + 4-byte length + NALU.
        assert_eq!(&frame.payload[9..], &[0x65, 1, 2, 3, 4, 5, 6]);
    }

    struct PliProbe {
        requested: Mutex<Vec<u32>>,
    }

    impl crate::hub::rtc::KeyframeRequester for PliProbe {
        fn request_keyframe(&self, ssrc: u32, _cid: ContextId) {
            self.requested.lock().push(ssrc);
        }
    }

    #[test]
    fn gap_in_fragmented_frame_drops_and_requests_keyframe() {
        use crate::hub::{rtc::RtcSourceRegistry, SourceEvents};
        use crate::hub::live::ConsumerBounds;

        let sink = Sink::new();
        let b = builder(&sink);

        let registry = RtcSourceRegistry::new(ConsumerBounds::default(), SourceEvents::new());
        let source =
            registry.fetch_or_create(&StreamRequest::new("rtc", "h", "live", "x", 8000));
        let probe = Arc::new(PliProbe {
            requested: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn crate::hub::rtc::KeyframeRequester> = probe.clone();
        source.set_keyframe_requester(Arc::downgrade(&as_dyn));
        b.set_source(Arc::downgrade(&source));

        let indicator = 0x60 | NALU_TYPE_FU_A;
        b.on_rtp(&video(1, 900, false, vec![indicator, FU_START | 5, 1, 2])).unwrap();
        // Sequence 2 lost; 3 arrives mid-fragment.
        b.on_rtp(&video(3, 900, true, vec![indicator, FU_END | 5, 5, 6])).unwrap();

        assert!(sink.frames.lock().is_empty());
        assert_eq!(*probe.requested.lock(), vec![7]);
    }

    #[test]
    fn audio_passes_through_as_aac_frames() {
        let sink = Sink::new();
        let b = builder(&sink);

        let pkt = Arc::new(RtpPacket {
            header: RtpHeader {
                marker: true,
                payload_type: 111,
                sequence_number: 50,
                timestamp: 960,
                ssrc: 9,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaa, 0xbb]),
        });
        b.on_rtp(&pkt).unwrap();

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_audio());
        assert_eq!(frames[0].timestamp, 20);
        assert_eq!(&frames[0].payload[2..], &[0xaa, 0xbb]);
    }

    #[tokio::test(start_paused = true)]
    async fn rtc_to_live_bridge_publishes_and_delivers_frames() {
        use crate::hub::live::{ConsumerBounds, LiveSourceRegistry};
        use crate::hub::SourceEvents;
        use std::time::Duration;

        let registry = LiveSourceRegistry::new(ConsumerBounds::default(), SourceEvents::new());
        let req = StreamRequest::new("rtc", "h", "live", "x", 8000);
        let live = registry.fetch_or_create(&req);

        let bridge = RtcToLiveBridge::new(
            Arc::clone(&live),
            ContextId::from_str("rtcpub"),
            FrameBuilderConfig::default(),
        );
        bridge.initialize(&req).unwrap();
        bridge.on_publish().unwrap();
        assert!(live.is_active());
        assert_eq!(live.publisher_cid(), Some(ContextId::from_str("rtcpub")));

        let consumer = live.create_consumer(ContextId::from_str("play"));
        bridge
            .on_rtp(&video(1, 1800, true, vec![0x65, 0x0a, 0x0b]))
            .unwrap();

        let frame = consumer
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert!(frame.is_keyframe());
        assert_eq!(frame.timestamp, 20);

        bridge.on_unpublish();
        assert!(consumer
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_payload_type_is_ignored() {
        let sink = Sink::new();
        let b = builder(&sink);
        let pkt = Arc::new(RtpPacket {
            header: RtpHeader {
                payload_type: 63,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1]),
        });
        b.on_rtp(&pkt).unwrap();
        assert!(sink.frames.lock().is_empty());
    }
}
