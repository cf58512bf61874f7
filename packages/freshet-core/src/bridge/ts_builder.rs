//! MPEG-TS to frame conversion for the SRT ingest path.
//!
//! Demultiplexes the publisher's transport stream, reassembles PES
//! payloads, splits AVC Annex-B on start codes and classifies the NALUs.
//! Seeing SPS and PPS composes an AVC sequence header; ADTS audio yields an
//! AAC sequence header from its first frame's config. Video frames carry
//! the PES DTS as their timestamp and `pts - dts` as composition offset.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::bridge::{CompositeBridge, FrameTarget, SrtBridge, SrtTarget, StreamBridge};
use crate::error::{ServerError, ServerResult};
use crate::packet::{
    aac_frame_payload, aac_sequence_header_payload, avc_frame_payload,
    avc_sequence_header_payload, MediaPacket, PacketKind,
};
use crate::protocol::mpegts::{
    adts_split, audio_specific_config, PesKind, PesPacket, TsDemuxer, TS_PACKET_SIZE,
};
use crate::request::StreamRequest;
use crate::rtp::h264::{annexb_split, avc_decoder_configuration, avcc_join, NaluKind};

#[derive(Default)]
struct TsState {
    demux: TsDemuxer,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    video_header_dirty: bool,
    audio_config: Option<(u8, u8, u8)>,
}

/// Converts raw TS chunks into media frames for a [`FrameTarget`].
pub struct TsFrameBuilder {
    target: Arc<dyn FrameTarget>,
    state: Mutex<TsState>,
}

impl TsFrameBuilder {
    /// Creates a builder feeding the given target.
    pub fn new(target: Arc<dyn FrameTarget>) -> Self {
        Self {
            target,
            state: Mutex::new(TsState::default()),
        }
    }

    /// Feeds a chunk of one or more 188-byte TS packets.
    pub fn on_ts_data(&self, data: &Bytes) -> ServerResult<()> {
        if data.len() % TS_PACKET_SIZE != 0 {
            return Err(ServerError::Protocol(format!(
                "ts chunk of {} bytes is not packet aligned",
                data.len()
            )));
        }

        let mut pes_packets = Vec::new();
        {
            let mut state = self.state.lock();
            for offset in (0..data.len()).step_by(TS_PACKET_SIZE) {
                let pkt = data.slice(offset..offset + TS_PACKET_SIZE);
                pes_packets.extend(state.demux.on_packet(&pkt)?);
            }
        }

        for pes in pes_packets {
            self.on_pes(&pes)?;
        }
        Ok(())
    }

    /// Flushes pending PES data at end of stream.
    pub fn flush(&self) -> ServerResult<()> {
        let pending = self.state.lock().demux.flush()?;
        for pes in pending {
            self.on_pes(&pes)?;
        }
        Ok(())
    }

    fn on_pes(&self, pes: &PesPacket) -> ServerResult<()> {
        match pes.kind {
            PesKind::Video => self.on_video_pes(pes),
            PesKind::Audio => self.on_audio_pes(pes),
        }
    }

    fn on_video_pes(&self, pes: &PesPacket) -> ServerResult<()> {
        let mut header: Option<Arc<MediaPacket>> = None;
        let mut frame: Option<Arc<MediaPacket>> = None;

        {
            let mut state = self.state.lock();
            let mut vcl: Vec<Bytes> = Vec::new();
            let mut keyframe = false;

            for nalu in annexb_split(&pes.payload) {
                if nalu.is_empty() {
                    continue;
                }
                match NaluKind::of(nalu[0]) {
                    NaluKind::Sps => {
                        let sps = Bytes::copy_from_slice(nalu);
                        if state.sps.as_ref() != Some(&sps) {
                            state.sps = Some(sps);
                            state.video_header_dirty = true;
                        }
                    }
                    NaluKind::Pps => {
                        let pps = Bytes::copy_from_slice(nalu);
                        if state.pps.as_ref() != Some(&pps) {
                            state.pps = Some(pps);
                            state.video_header_dirty = true;
                        }
                    }
                    NaluKind::AccessUnitDelimiter => {}
                    kind => {
                        if kind == NaluKind::Idr {
                            keyframe = true;
                        }
                        vcl.push(Bytes::copy_from_slice(nalu));
                    }
                }
            }

            if state.video_header_dirty {
                if let (Some(sps), Some(pps)) = (state.sps.clone(), state.pps.clone()) {
                    let config = avc_decoder_configuration(&sps, &pps)?;
                    header = Some(MediaPacket::new(
                        PacketKind::Video,
                        pes.dts_ms,
                        avc_sequence_header_payload(&config),
                    ));
                    state.video_header_dirty = false;
                }
            }

            if !vcl.is_empty() {
                let cts = (pes.pts_ms - pes.dts_ms).max(0) as i32;
                frame = Some(MediaPacket::new(
                    PacketKind::Video,
                    pes.dts_ms,
                    avc_frame_payload(keyframe, cts, &avcc_join(&vcl)),
                ));
            }
        }

        if let Some(header) = header {
            self.target.on_frame(&header)?;
        }
        if let Some(frame) = frame {
            self.target.on_frame(&frame)?;
        }
        Ok(())
    }

    fn on_audio_pes(&self, pes: &PesPacket) -> ServerResult<()> {
        let frames = adts_split(&pes.payload)?;
        for (aot, freq, channels, raw) in frames {
            let header = {
                let mut state = self.state.lock();
                if state.audio_config != Some((aot, freq, channels)) {
                    state.audio_config = Some((aot, freq, channels));
                    let asc = audio_specific_config(aot, freq, channels);
                    Some(MediaPacket::new(
                        PacketKind::Audio,
                        pes.pts_ms,
                        aac_sequence_header_payload(&asc),
                    ))
                } else {
                    None
                }
            };
            if let Some(header) = header {
                self.target.on_frame(&header)?;
            }
            self.target
                .on_frame(&MediaPacket::new(PacketKind::Audio, pes.pts_ms, aac_frame_payload(&raw)))?;
        }
        Ok(())
    }
}

/// TS-domain bridge delivering an SRT publisher's stream to the frame
/// domains (live and, through a chained bridge, RTC).
pub struct SrtToFrameBridge {
    builder: TsFrameBuilder,
    inner: Arc<CompositeBridge>,
}

impl SrtToFrameBridge {
    /// Creates the bridge over the composed frame-domain targets.
    pub fn new(inner: Arc<CompositeBridge>) -> Arc<Self> {
        Arc::new(Self {
            builder: TsFrameBuilder::new(Arc::clone(&inner) as Arc<dyn FrameTarget>),
            inner,
        })
    }
}

impl SrtTarget for SrtToFrameBridge {
    fn on_packet(&self, data: &Bytes) -> ServerResult<()> {
        match self.builder.on_ts_data(data) {
            // Transient demux errors are logged and dropped.
            Err(err @ ServerError::Protocol(_)) => {
                log::warn!("[SrtBridge] drop ts chunk: {}", err);
                Ok(())
            }
            other => other,
        }
    }
}

impl SrtBridge for SrtToFrameBridge {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()> {
        self.inner.initialize(req)
    }

    fn on_publish(&self) -> ServerResult<()> {
        self.inner.on_publish()
    }

    fn on_unpublish(&self) {
        if let Err(err) = self.builder.flush() {
            log::warn!("[SrtBridge] flush at unpublish: {}", err);
        }
        self.inner.on_unpublish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mpegts::{adts_frame, TsMuxer};

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

    /// Muxes an IDR access unit (SPS+PPS+IDR) and an AAC frame into TS.
    fn sample_ts() -> Bytes {
        let mut mux = TsMuxer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&mux.pat());
        wire.extend_from_slice(&mux.pmt());

        let mut es = Vec::new();
        for nalu in [
            &[0x67u8, 0x64, 0x00, 0x1f, 0xac][..],
            &[0x68, 0xeb, 0xec][..],
            &[0x65, 0x11, 0x22, 0x33][..],
        ] {
            es.extend_from_slice(&[0, 0, 0, 1]);
            es.extend_from_slice(nalu);
        }
        wire.extend(mux.write_pes(PesKind::Video, 140, 100, &es, true));

        let adts = adts_frame(2, 4, 2, &[0x21, 0x22]);
        wire.extend(mux.write_pes(PesKind::Audio, 120, 120, &adts, false));
        Bytes::from(wire)
    }

    #[test]
    fn idr_access_unit_yields_header_then_keyframe() {
        let sink = Sink::new();
        let builder = TsFrameBuilder::new(Arc::clone(&sink) as Arc<dyn FrameTarget>);

        builder.on_ts_data(&sample_ts()).unwrap();
        builder.flush().unwrap();

        let frames = sink.frames.lock();
        let video: Vec<_> = frames.iter().filter(|f| f.is_video()).collect();
        assert_eq!(video.len(), 2);
        assert!(video[0].is_video_sequence_header());
        assert_eq!(video[0].timestamp, 100);
        assert!(video[1].is_keyframe());
        assert_eq!(video[1].timestamp, 100);
        // Composition offset pts-dts = 40ms.
        assert_eq!(&video[1].payload[2..5], &[0, 0, 40]);

        let audio: Vec<_> = frames.iter().filter(|f| f.is_audio()).collect();
        assert_eq!(audio.len(), 2);
        assert!(audio[0].is_audio_sequence_header());
        assert_eq!(audio[1].timestamp, 120);
    }

    #[test]
    fn audio_header_emitted_once_per_config() {
        let sink = Sink::new();
        let builder = TsFrameBuilder::new(Arc::clone(&sink) as Arc<dyn FrameTarget>);

        let mut mux = TsMuxer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&mux.pat());
        wire.extend_from_slice(&mux.pmt());
        for i in 0..3i64 {
            let adts = adts_frame(2, 4, 2, &[i as u8]);
            wire.extend(mux.write_pes(PesKind::Audio, 100 + i * 20, 100 + i * 20, &adts, false));
        }
        builder.on_ts_data(&Bytes::from(wire)).unwrap();
        builder.flush().unwrap();

        let frames = sink.frames.lock();
        let headers = frames
            .iter()
            .filter(|f| f.is_audio_sequence_header())
            .count();
        assert_eq!(headers, 1);
        assert_eq!(frames.iter().filter(|f| f.is_audio()).count(), 4);
    }

    #[test]
    fn unaligned_chunk_is_rejected() {
        let sink = Sink::new();
        let builder = TsFrameBuilder::new(Arc::clone(&sink) as Arc<dyn FrameTarget>);
        assert!(builder.on_ts_data(&Bytes::from_static(&[0x47; 100])).is_err());
    }
}
