//! H.264 NALU utilities for the RTP payload format (RFC 6184).
//!
//! Covers what the bridges need: Annex-B and AVCC splitting, NALU
//! classification, and the STAP-A / FU-A constants and header bits.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ServerError, ServerResult};

/// NALU type for an aggregated SPS+PPS packet.
pub const NALU_TYPE_STAP_A: u8 = 24;
/// NALU type for a fragmentation unit.
pub const NALU_TYPE_FU_A: u8 = 28;

/// FU header start bit.
pub const FU_START: u8 = 0x80;
/// FU header end bit.
pub const FU_END: u8 = 0x40;

/// H.264 NALU kinds the server distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluKind {
    NonIdr,
    Idr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl NaluKind {
    /// Classifies a NALU from its header byte.
    pub fn of(header: u8) -> Self {
        match header & 0x1f {
            1 => Self::NonIdr,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            t => Self::Other(t),
        }
    }
}

/// The raw NALU type value (low five bits of the header byte).
#[inline]
pub fn nalu_type(header: u8) -> u8 {
    header & 0x1f
}

/// Splits an Annex-B elementary stream on `00 00 01` / `00 00 00 01` start
/// codes, returning the NALUs without their start codes.
pub fn annexb_split(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut i = 0usize;
    let mut start: Option<usize> = None;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if s < code_start {
                    nalus.push(&data[s..code_start]);
                }
            }
            i += 3;
            start = Some(i);
            continue;
        }
        i += 1;
    }

    if let Some(s) = start {
        if s < data.len() {
            nalus.push(&data[s..]);
        }
    }
    nalus
}

/// Splits AVCC (length-prefixed) data into NALUs.
pub fn avcc_split(data: &Bytes, nalu_len_size: usize) -> ServerResult<Vec<Bytes>> {
    if !(1..=4).contains(&nalu_len_size) {
        return Err(ServerError::Protocol(format!(
            "bad NALU length size {}",
            nalu_len_size
        )));
    }

    let mut nalus = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if offset + nalu_len_size > data.len() {
            return Err(ServerError::Protocol("AVCC length prefix overrun".into()));
        }
        let mut len = 0usize;
        for i in 0..nalu_len_size {
            len = (len << 8) | data[offset + i] as usize;
        }
        offset += nalu_len_size;
        if offset + len > data.len() {
            return Err(ServerError::Protocol(format!(
                "AVCC NALU overrun: {} bytes claimed, {} left",
                len,
                data.len() - offset
            )));
        }
        if len > 0 {
            nalus.push(data.slice(offset..offset + len));
        }
        offset += len;
    }
    Ok(nalus)
}

/// Joins NALUs into AVCC form with 4-byte length prefixes.
pub fn avcc_join(nalus: &[Bytes]) -> Bytes {
    let total: usize = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nalu in nalus {
        buf.put_u32(nalu.len() as u32);
        buf.put_slice(nalu);
    }
    buf.freeze()
}

/// Composes an AVCDecoderConfigurationRecord from SPS and PPS.
pub fn avc_decoder_configuration(sps: &[u8], pps: &[u8]) -> ServerResult<Bytes> {
    if sps.len() < 4 {
        return Err(ServerError::Protocol("SPS too short".into()));
    }
    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01); // configurationVersion
    buf.put_u8(sps[1]); // AVCProfileIndication
    buf.put_u8(sps[2]); // profile_compatibility
    buf.put_u8(sps[3]); // AVCLevelIndication
    buf.put_u8(0xff); // 4-byte NALU lengths
    buf.put_u8(0xe1); // one SPS
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01); // one PPS
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    Ok(buf.freeze())
}

/// Parses the SPS and PPS out of an AVCDecoderConfigurationRecord.
pub fn parse_decoder_configuration(config: &Bytes) -> ServerResult<(Bytes, Bytes)> {
    if config.len() < 7 || config[0] != 0x01 {
        return Err(ServerError::Protocol("bad AVC decoder configuration".into()));
    }
    let sps_count = (config[5] & 0x1f) as usize;
    if sps_count == 0 {
        return Err(ServerError::Protocol("no SPS in decoder configuration".into()));
    }
    let mut offset = 6;
    if config.len() < offset + 2 {
        return Err(ServerError::Protocol("decoder configuration overrun".into()));
    }
    let sps_len = u16::from_be_bytes([config[offset], config[offset + 1]]) as usize;
    offset += 2;
    if config.len() < offset + sps_len {
        return Err(ServerError::Protocol("SPS overrun".into()));
    }
    let sps = config.slice(offset..offset + sps_len);
    offset += sps_len;

    // Skip any additional SPS entries.
    for _ in 1..sps_count {
        if config.len() < offset + 2 {
            return Err(ServerError::Protocol("decoder configuration overrun".into()));
        }
        let len = u16::from_be_bytes([config[offset], config[offset + 1]]) as usize;
        offset += 2 + len;
    }

    if config.len() < offset + 1 {
        return Err(ServerError::Protocol("no PPS in decoder configuration".into()));
    }
    let pps_count = config[offset] as usize;
    offset += 1;
    if pps_count == 0 || config.len() < offset + 2 {
        return Err(ServerError::Protocol("no PPS in decoder configuration".into()));
    }
    let pps_len = u16::from_be_bytes([config[offset], config[offset + 1]]) as usize;
    offset += 2;
    if config.len() < offset + pps_len {
        return Err(ServerError::Protocol("PPS overrun".into()));
    }
    let pps = config.slice(offset..offset + pps_len);

    Ok((sps, pps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_annexb_with_mixed_start_codes() {
        let data = [
            0, 0, 0, 1, 0x67, 0xaa, // SPS, 4-byte code
            0, 0, 1, 0x68, 0xbb, // PPS, 3-byte code
            0, 0, 0, 1, 0x65, 0x11, 0x22, // IDR
        ];
        let nalus = annexb_split(&data);
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalus[0], &[0x67, 0xaa]);
        assert_eq!(nalus[1], &[0x68, 0xbb]);
        assert_eq!(nalus[2], &[0x65, 0x11, 0x22]);
        assert_eq!(NaluKind::of(nalus[0][0]), NaluKind::Sps);
        assert_eq!(NaluKind::of(nalus[1][0]), NaluKind::Pps);
        assert_eq!(NaluKind::of(nalus[2][0]), NaluKind::Idr);
    }

    #[test]
    fn annexb_without_start_code_yields_nothing() {
        assert!(annexb_split(&[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn avcc_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x65, 1, 2, 3]),
            Bytes::from_static(&[0x41, 9]),
        ];
        let joined = avcc_join(&nalus);
        let split = avcc_split(&joined, 4).unwrap();
        assert_eq!(split, nalus);
    }

    #[test]
    fn avcc_split_rejects_overrun() {
        let bad = Bytes::from_static(&[0, 0, 0, 10, 0x65]);
        assert!(avcc_split(&bad, 4).is_err());
    }

    #[test]
    fn decoder_configuration_round_trip() {
        let sps = [0x67, 0x64, 0x00, 0x1f, 0xac];
        let pps = [0x68, 0xeb, 0xec];
        let config = avc_decoder_configuration(&sps, &pps).unwrap();
        assert_eq!(config[0], 0x01);
        assert_eq!(config[1], 0x64);

        let (got_sps, got_pps) = parse_decoder_configuration(&config).unwrap();
        assert_eq!(got_sps.as_ref(), &sps);
        assert_eq!(got_pps.as_ref(), &pps);
    }
}
