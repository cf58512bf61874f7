//! RTP packet marshal/unmarshal.
//!
//! The 12-byte fixed header plus CSRC list and one-byte-profile extensions,
//! per RFC 3550. The payload keeps zero-copy `Bytes` slices of the receive
//! buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ServerError, ServerResult};

const RTP_VERSION: u8 = 2;
const FIXED_HEADER_LEN: usize = 12;

/// Wrap-aware "is `a` newer than `b`" in 16-bit sequence space.
#[inline]
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Wrap-aware forward distance from `b` to `a`.
#[inline]
pub fn seq_distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

/// RTP fixed header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// Raw extension payload (profile + data), kept opaque.
    pub extension_profile: u16,
    pub extension_payload: Bytes,
}

/// One RTP packet.
#[derive(Debug, Clone, Default)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parses a packet from a datagram.
    pub fn unmarshal(buf: &Bytes) -> ServerResult<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(ServerError::Protocol(format!(
                "rtp packet too short: {} bytes",
                buf.len()
            )));
        }

        let b0 = buf[0];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(ServerError::Protocol(format!("rtp version {}", version)));
        }

        let padding = (b0 & 0x20) != 0;
        let extension = (b0 & 0x10) != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let b1 = buf[1];
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7f;

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = FIXED_HEADER_LEN;
        if buf.len() < offset + csrc_count * 4 {
            return Err(ServerError::Protocol("rtp csrc overrun".into()));
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]));
            offset += 4;
        }

        let mut extension_profile = 0u16;
        let mut extension_payload = Bytes::new();
        if extension {
            if buf.len() < offset + 4 {
                return Err(ServerError::Protocol("rtp extension header overrun".into()));
            }
            extension_profile = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4;
            let ext_len = words * 4;
            if buf.len() < offset + ext_len {
                return Err(ServerError::Protocol("rtp extension overrun".into()));
            }
            extension_payload = buf.slice(offset..offset + ext_len);
            offset += ext_len;
        }

        let mut end = buf.len();
        if padding {
            if end == offset {
                return Err(ServerError::Protocol("rtp padding without payload".into()));
            }
            let pad = buf[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(ServerError::Protocol("rtp bad padding".into()));
            }
            end -= pad;
        }

        Ok(Self {
            header: RtpHeader {
                padding,
                extension,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
                extension_profile,
                extension_payload,
            },
            payload: buf.slice(offset..end),
        })
    }

    /// Serialized size of the packet.
    pub fn marshal_size(&self) -> usize {
        let mut n = FIXED_HEADER_LEN + self.header.csrc.len() * 4;
        if self.header.extension {
            n += 4 + self.header.extension_payload.len();
        }
        n + self.payload.len()
    }

    /// Serializes the packet into a fresh buffer.
    pub fn marshal(&self) -> Bytes {
        let h = &self.header;
        let mut buf = BytesMut::with_capacity(self.marshal_size());

        let mut b0 = RTP_VERSION << 6;
        if h.padding {
            b0 |= 0x20;
        }
        if h.extension {
            b0 |= 0x10;
        }
        b0 |= (h.csrc.len() as u8) & 0x0f;
        buf.put_u8(b0);

        let mut b1 = h.payload_type & 0x7f;
        if h.marker {
            b1 |= 0x80;
        }
        buf.put_u8(b1);

        buf.put_u16(h.sequence_number);
        buf.put_u32(h.timestamp);
        buf.put_u32(h.ssrc);
        for csrc in &h.csrc {
            buf.put_u32(*csrc);
        }
        if h.extension {
            buf.put_u16(h.extension_profile);
            buf.put_u16((h.extension_payload.len() / 4) as u16);
            buf.put_slice(&h.extension_payload);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
