//! Shared media packets.
//!
//! A [`MediaPacket`] is created once by the ingesting adapter and handed to
//! every consumer queue and bridge as `Arc<MediaPacket>`: the payload is
//! immutable after sharing, the reference count is the only mutable region,
//! and the packet is freed when the last holder drops it.
//!
//! Video and audio payloads use FLV tag-body layout (codec nibble first),
//! which is what the RTMP domain speaks natively and what the bridges
//! repacketize from.

use bytes::Bytes;

/// What a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Metadata,
    /// RTMP aggregate message: multiple tags in one payload.
    Aggregate,
}

/// FLV video codec id for AVC/H.264.
pub const FLV_VIDEO_CODEC_AVC: u8 = 7;
/// FLV audio codec id for AAC.
pub const FLV_AUDIO_CODEC_AAC: u8 = 10;

/// A reference-counted media payload with a millisecond timestamp.
#[derive(Debug)]
pub struct MediaPacket {
    pub kind: PacketKind,
    /// Presentation timestamp in milliseconds, monotonically non-decreasing
    /// within a stream.
    pub timestamp: i64,
    /// Tag-body bytes; immutable once the packet is shared.
    pub payload: Bytes,
}

impl MediaPacket {
    /// Creates a packet ready for sharing.
    pub fn new(kind: PacketKind, timestamp: i64, payload: Bytes) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            kind,
            timestamp,
            payload,
        })
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    /// Whether a video payload carries the AVC decoder configuration
    /// (sequence header): codec AVC and AVCPacketType 0.
    pub fn is_video_sequence_header(&self) -> bool {
        self.kind == PacketKind::Video
            && self.payload.len() >= 2
            && (self.payload[0] & 0x0f) == FLV_VIDEO_CODEC_AVC
            && self.payload[1] == 0
    }

    /// Whether a video payload is an AVC keyframe (frame type 1).
    pub fn is_keyframe(&self) -> bool {
        self.kind == PacketKind::Video
            && !self.payload.is_empty()
            && (self.payload[0] >> 4) == 1
            && (self.payload[0] & 0x0f) == FLV_VIDEO_CODEC_AVC
    }

    /// Whether an audio payload carries the AAC audio specific config
    /// (sequence header): codec AAC and AACPacketType 0.
    pub fn is_audio_sequence_header(&self) -> bool {
        self.kind == PacketKind::Audio
            && self.payload.len() >= 2
            && (self.payload[0] >> 4) == FLV_AUDIO_CODEC_AAC
            && self.payload[1] == 0
    }

    /// Whether the packet must seed the header cache of a source.
    pub fn is_sequence_header(&self) -> bool {
        self.is_video_sequence_header() || self.is_audio_sequence_header()
    }
}

/// Builds the FLV tag body of an AVC sequence header from the
/// AVCDecoderConfigurationRecord bytes.
pub fn avc_sequence_header_payload(config: &[u8]) -> Bytes {
    let mut body = Vec::with_capacity(5 + config.len());
    body.push(0x17); // keyframe, codec AVC
    body.push(0x00); // AVCPacketType: sequence header
    body.extend_from_slice(&[0, 0, 0]); // composition time
    body.extend_from_slice(config);
    Bytes::from(body)
}

/// Builds the FLV tag body of an AVC NALU frame (AVCC length-prefixed).
pub fn avc_frame_payload(keyframe: bool, cts: i32, avcc: &[u8]) -> Bytes {
    let mut body = Vec::with_capacity(5 + avcc.len());
    body.push(if keyframe { 0x17 } else { 0x27 });
    body.push(0x01); // AVCPacketType: NALU
    let cts_bytes = cts.to_be_bytes();
    body.extend_from_slice(&cts_bytes[1..4]);
    body.extend_from_slice(avcc);
    Bytes::from(body)
}

/// Builds the FLV tag body of an AAC sequence header from the
/// AudioSpecificConfig bytes.
pub fn aac_sequence_header_payload(asc: &[u8]) -> Bytes {
    let mut body = Vec::with_capacity(2 + asc.len());
    body.push(0xaf); // AAC, 44kHz hint, 16-bit, stereo
    body.push(0x00); // AACPacketType: sequence header
    body.extend_from_slice(asc);
    Bytes::from(body)
}

/// Builds the FLV tag body of an AAC raw frame.
pub fn aac_frame_payload(raw: &[u8]) -> Bytes {
    let mut body = Vec::with_capacity(2 + raw.len());
    body.push(0xaf);
    body.push(0x01); // AACPacketType: raw
    body.extend_from_slice(raw);
    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_avc_sequence_header() {
        let pkt = MediaPacket::new(
            PacketKind::Video,
            0,
            avc_sequence_header_payload(&[0x01, 0x64, 0x00, 0x1f]),
        );
        assert!(pkt.is_video_sequence_header());
        assert!(pkt.is_keyframe());
        assert!(pkt.is_sequence_header());
    }

    #[test]
    fn classifies_avc_interframe() {
        let pkt = MediaPacket::new(
            PacketKind::Video,
            40,
            avc_frame_payload(false, 0, &[0, 0, 0, 1, 0x41]),
        );
        assert!(!pkt.is_video_sequence_header());
        assert!(!pkt.is_keyframe());
    }

    #[test]
    fn classifies_aac_sequence_header() {
        let pkt = MediaPacket::new(PacketKind::Audio, 0, aac_sequence_header_payload(&[0x12, 0x10]));
        assert!(pkt.is_audio_sequence_header());
        assert!(!pkt.is_video_sequence_header());
    }

    #[test]
    fn aac_raw_frame_is_not_sequence_header() {
        let pkt = MediaPacket::new(PacketKind::Audio, 20, aac_frame_payload(&[0xde, 0xad]));
        assert!(!pkt.is_sequence_header());
    }

    #[test]
    fn metadata_never_matches_codec_checks() {
        let pkt = MediaPacket::new(PacketKind::Metadata, 0, Bytes::from_static(b"onMetaData"));
        assert!(pkt.is_metadata());
        assert!(!pkt.is_sequence_header());
        assert!(!pkt.is_keyframe());
    }
}
