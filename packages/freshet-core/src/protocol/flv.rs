//! FLV serialization for HTTP-FLV delivery.
//!
//! A player's HTTP response body is the FLV header followed by one tag per
//! media packet; each tag carries the same FLV tag-body bytes the RTMP
//! domain already uses, so serving is a framing exercise only.

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{MediaPacket, PacketKind};

/// FLV tag types.
pub mod tag_type {
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const SCRIPT: u8 = 18;
}

/// The 9-byte FLV header plus the zero PreviousTagSize0.
pub fn file_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    buf.put_u8(flags);
    buf.put_u32(9); // data offset
    buf.put_u32(0); // PreviousTagSize0
    buf.freeze()
}

/// Serializes one tag (header + body + PreviousTagSize).
pub fn encode_tag(tag: u8, timestamp: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(11 + body.len() + 4);
    buf.put_u8(tag);
    buf.put_slice(&(body.len() as u32).to_be_bytes()[1..]);
    // 24-bit timestamp plus the extension byte.
    buf.put_slice(&timestamp.to_be_bytes()[1..]);
    buf.put_u8((timestamp >> 24) as u8);
    buf.put_slice(&[0, 0, 0]); // stream id
    buf.put_slice(body);
    buf.put_u32(11 + body.len() as u32);
    buf.freeze()
}

/// Serializes a media packet as its FLV tag.
pub fn encode_packet(pkt: &MediaPacket) -> Bytes {
    let tag = match pkt.kind {
        PacketKind::Audio => tag_type::AUDIO,
        PacketKind::Video => tag_type::VIDEO,
        PacketKind::Metadata | PacketKind::Aggregate => tag_type::SCRIPT,
    };
    encode_tag(tag, pkt.timestamp as u32, &pkt.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_flags_reflect_tracks() {
        let both = file_header(true, true);
        assert_eq!(&both[..3], b"FLV");
        assert_eq!(both[4], 0x05);
        assert_eq!(both.len(), 13);

        let video_only = file_header(false, true);
        assert_eq!(video_only[4], 0x01);
    }

    #[test]
    fn tag_layout_is_stable() {
        let tag = encode_tag(tag_type::VIDEO, 0x0102_0304, &[0xaa, 0xbb]);
        assert_eq!(tag[0], 9);
        // 24-bit size.
        assert_eq!(&tag[1..4], &[0, 0, 2]);
        // Timestamp low 24 bits then the extension byte.
        assert_eq!(&tag[4..8], &[0x02, 0x03, 0x04, 0x01]);
        // PreviousTagSize = 11 + body.
        assert_eq!(&tag[tag.len() - 4..], &13u32.to_be_bytes());
    }

    #[test]
    fn packet_maps_to_its_tag_type() {
        let audio = MediaPacket::new(PacketKind::Audio, 20, Bytes::from_static(&[0xaf, 1, 2]));
        assert_eq!(encode_packet(&audio)[0], tag_type::AUDIO);

        let meta = MediaPacket::new(PacketKind::Metadata, 0, Bytes::from_static(&[2]));
        assert_eq!(encode_packet(&meta)[0], tag_type::SCRIPT);
    }
}
