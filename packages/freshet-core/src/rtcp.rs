//! RTCP feedback packets: transport-layer NACK and PLI.
//!
//! Only the two feedback formats the server emits and consumes are
//! implemented (RFC 4585): the generic NACK (PT 205, FMT 1) carrying
//! PID/BLP runs, and the picture loss indication (PT 206, FMT 1).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ServerError, ServerResult};

const RTCP_VERSION: u8 = 2;
/// Transport-layer feedback.
pub const PT_RTPFB: u8 = 205;
/// Payload-specific feedback.
pub const PT_PSFB: u8 = 206;
const FMT_NACK: u8 = 1;
const FMT_PLI: u8 = 1;

/// One PID/BLP pair: the lost packet id plus a bitmask of the following
/// sixteen sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_mask: u16,
}

impl NackPair {
    /// Expands the pair into the sequences it names.
    pub fn sequences(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for bit in 0..16u16 {
            if self.lost_mask & (1 << bit) != 0 {
                seqs.push(self.packet_id.wrapping_add(bit + 1));
            }
        }
        seqs
    }
}

/// Packs sorted sequences into the minimal PID/BLP run list.
pub fn pack_nack_pairs(seqs: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = Vec::new();
    for &seq in seqs {
        if let Some(last) = pairs.last_mut() {
            let distance = seq.wrapping_sub(last.packet_id);
            if distance != 0 && distance <= 16 {
                last.lost_mask |= 1 << (distance - 1);
                continue;
            }
        }
        pairs.push(NackPair {
            packet_id: seq,
            lost_mask: 0,
        });
    }
    pairs
}

/// A transport-layer NACK naming lost sequences of `media_ssrc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub pairs: Vec<NackPair>,
}

impl TransportNack {
    /// Builds a NACK from a sorted sequence list.
    pub fn from_sequences(sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            pairs: pack_nack_pairs(seqs),
        }
    }

    /// All sequences this NACK names.
    pub fn sequences(&self) -> Vec<u16> {
        self.pairs.iter().flat_map(NackPair::sequences).collect()
    }

    /// Serializes the packet.
    pub fn marshal(&self) -> Bytes {
        let words = 2 + self.pairs.len(); // header words beyond the first
        let mut buf = BytesMut::with_capacity(4 + words * 4);
        buf.put_u8((RTCP_VERSION << 6) | FMT_NACK);
        buf.put_u8(PT_RTPFB);
        buf.put_u16(words as u16);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for pair in &self.pairs {
            buf.put_u16(pair.packet_id);
            buf.put_u16(pair.lost_mask);
        }
        buf.freeze()
    }

    /// Parses a NACK from one RTCP packet.
    pub fn unmarshal(buf: &Bytes) -> ServerResult<Self> {
        if buf.len() < 12 {
            return Err(ServerError::Protocol("rtcp nack too short".into()));
        }
        if buf[0] != (RTCP_VERSION << 6) | FMT_NACK || buf[1] != PT_RTPFB {
            return Err(ServerError::Protocol("not a transport nack".into()));
        }
        let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let expected = 4 + words * 4;
        if buf.len() < expected {
            return Err(ServerError::Protocol("rtcp nack truncated".into()));
        }
        let sender_ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let media_ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let mut pairs = Vec::new();
        let mut offset = 12;
        while offset + 4 <= expected {
            pairs.push(NackPair {
                packet_id: u16::from_be_bytes([buf[offset], buf[offset + 1]]),
                lost_mask: u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]),
            });
            offset += 4;
        }
        Ok(Self {
            sender_ssrc,
            media_ssrc,
            pairs,
        })
    }
}

/// A picture loss indication: ask the sender for a fresh keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureLossIndication {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl PictureLossIndication {
    /// Serializes the packet.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8((RTCP_VERSION << 6) | FMT_PLI);
        buf.put_u8(PT_PSFB);
        buf.put_u16(2);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.freeze()
    }

    /// Parses a PLI from one RTCP packet.
    pub fn unmarshal(buf: &Bytes) -> ServerResult<Self> {
        if buf.len() < 12 {
            return Err(ServerError::Protocol("rtcp pli too short".into()));
        }
        if buf[0] != (RTCP_VERSION << 6) | FMT_PLI || buf[1] != PT_PSFB {
            return Err(ServerError::Protocol("not a pli".into()));
        }
        Ok(Self {
            sender_ssrc: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            media_ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_adjacent_sequences_into_one_pair() {
        let pairs = pack_nack_pairs(&[100, 101, 103, 116]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 100);
        // 101 -> bit 0, 103 -> bit 2, 116 -> bit 15.
        assert_eq!(pairs[0].lost_mask, 0b1000_0000_0000_0101);

        let mut seqs = pairs[0].sequences();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![100, 101, 103, 116]);
    }

    #[test]
    fn distant_sequences_start_new_pairs() {
        let pairs = pack_nack_pairs(&[100, 200]);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].packet_id, 100);
        assert_eq!(pairs[1].packet_id, 200);
    }

    #[test]
    fn nack_round_trip() {
        let nack = TransportNack::from_sequences(0x1111, 0x2222, &[102]);
        let wire = nack.marshal();
        assert_eq!(wire.len(), 16);

        let parsed = TransportNack::unmarshal(&wire).unwrap();
        assert_eq!(parsed, nack);
        assert_eq!(parsed.sequences(), vec![102]);
    }

    #[test]
    fn pli_round_trip() {
        let pli = PictureLossIndication {
            sender_ssrc: 7,
            media_ssrc: 0xdeadbeef,
        };
        let parsed = PictureLossIndication::unmarshal(&pli.marshal()).unwrap();
        assert_eq!(parsed, pli);
    }

    #[test]
    fn nack_rejects_wrong_payload_type() {
        let pli = PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 2,
        };
        assert!(TransportNack::unmarshal(&pli.marshal()).is_err());
    }
}
