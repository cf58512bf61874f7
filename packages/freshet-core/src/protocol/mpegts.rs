//! MPEG transport stream demux and mux.
//!
//! Demux side: 188-byte packets in, PAT/PMT discovery, PES reassembly per
//! PID, and DTS/PTS extraction for the SRT ingest path. Mux side: PAT/PMT
//! and PES packetization with PCR for writing HLS segments. Both sides only
//! understand the two stream types the server carries: H.264 (0x1b) and
//! AAC ADTS (0x0f).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ServerError, ServerResult};

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Stream type for H.264 video.
pub const STREAM_TYPE_H264: u8 = 0x1b;
/// Stream type for AAC audio in ADTS framing.
pub const STREAM_TYPE_AAC: u8 = 0x0f;

/// PIDs this muxer emits.
pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

/// 90 kHz clock units per millisecond.
const TS_UNITS_PER_MS: u64 = 90;

/// Which elementary track a PES belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesKind {
    Video,
    Audio,
}

/// One reassembled PES packet.
#[derive(Debug, Clone)]
pub struct PesPacket {
    pub kind: PesKind,
    pub pid: u16,
    /// Presentation timestamp in milliseconds.
    pub pts_ms: i64,
    /// Decode timestamp in milliseconds (pts when absent).
    pub dts_ms: i64,
    /// Elementary stream bytes (Annex-B for video, ADTS for audio).
    pub payload: Bytes,
}

struct PesAccumulator {
    kind: PesKind,
    buf: BytesMut,
    started: bool,
}

/// Demultiplexes TS packets into PES packets.
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    video: PesAccumulator,
    audio: PesAccumulator,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            pmt_pid: None,
            video_pid: None,
            audio_pid: None,
            video: PesAccumulator {
                kind: PesKind::Video,
                buf: BytesMut::new(),
                started: false,
            },
            audio: PesAccumulator {
                kind: PesKind::Audio,
                buf: BytesMut::new(),
                started: false,
            },
        }
    }

    /// Whether PAT and PMT have been seen.
    pub fn is_ready(&self) -> bool {
        self.video_pid.is_some() || self.audio_pid.is_some()
    }

    /// Feeds one 188-byte packet; returns any PES completed by it.
    pub fn on_packet(&mut self, data: &Bytes) -> ServerResult<Vec<PesPacket>> {
        if data.len() != TS_PACKET_SIZE {
            return Err(ServerError::Protocol(format!(
                "ts packet size {} != 188",
                data.len()
            )));
        }
        if data[0] != SYNC_BYTE {
            return Err(ServerError::Protocol("ts sync byte missing".into()));
        }

        let pusi = data[1] & 0x40 != 0;
        let pid = u16::from_be_bytes([data[1] & 0x1f, data[2]]);
        let afc = (data[3] >> 4) & 0x03;

        let mut offset = 4usize;
        if afc == 2 {
            // Adaptation only, no payload.
            return Ok(Vec::new());
        }
        if afc == 3 {
            let af_len = data[4] as usize;
            offset += 1 + af_len;
            if offset >= TS_PACKET_SIZE {
                return Ok(Vec::new());
            }
        }

        if pid == PID_PAT {
            self.parse_pat(&data[offset..])?;
            return Ok(Vec::new());
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(&data[offset..])?;
            return Ok(Vec::new());
        }

        let kind = if Some(pid) == self.video_pid {
            PesKind::Video
        } else if Some(pid) == self.audio_pid {
            PesKind::Audio
        } else {
            return Ok(Vec::new());
        };

        let mut completed = Vec::new();
        let acc = match kind {
            PesKind::Video => &mut self.video,
            PesKind::Audio => &mut self.audio,
        };

        if pusi {
            // A new PES starts: the previous one is complete.
            if acc.started && !acc.buf.is_empty() {
                if let Some(pes) = Self::parse_pes(acc.kind, pid, acc.buf.split().freeze())? {
                    completed.push(pes);
                }
            }
            acc.buf.clear();
            acc.started = true;
        }
        if acc.started {
            acc.buf.extend_from_slice(&data[offset..]);
        }

        Ok(completed)
    }

    /// Flushes any partially accumulated PES (at end of stream).
    pub fn flush(&mut self) -> ServerResult<Vec<PesPacket>> {
        let mut completed = Vec::new();
        for acc in [&mut self.video, &mut self.audio] {
            if acc.started && !acc.buf.is_empty() {
                let pid = match acc.kind {
                    PesKind::Video => PID_VIDEO,
                    PesKind::Audio => PID_AUDIO,
                };
                if let Some(pes) = Self::parse_pes(acc.kind, pid, acc.buf.split().freeze())? {
                    completed.push(pes);
                }
            }
            acc.started = false;
        }
        Ok(completed)
    }

    fn parse_pat(&mut self, section: &[u8]) -> ServerResult<()> {
        // pointer_field, then the section.
        if section.is_empty() {
            return Err(ServerError::Protocol("empty pat".into()));
        }
        let ptr = section[0] as usize;
        let table = &section[1 + ptr..];
        if table.len() < 12 || table[0] != 0x00 {
            return Err(ServerError::Protocol("bad pat table".into()));
        }
        let section_len = u16::from_be_bytes([table[1] & 0x0f, table[2]]) as usize;
        // First program entry sits after the 8-byte fixed part.
        let entries_end = (3 + section_len).saturating_sub(4).min(table.len());
        let mut pos = 8;
        while pos + 4 <= entries_end {
            let program = u16::from_be_bytes([table[pos], table[pos + 1]]);
            let pid = u16::from_be_bytes([table[pos + 2] & 0x1f, table[pos + 3]]);
            if program != 0 {
                self.pmt_pid = Some(pid);
                return Ok(());
            }
            pos += 4;
        }
        Ok(())
    }

    fn parse_pmt(&mut self, section: &[u8]) -> ServerResult<()> {
        if section.is_empty() {
            return Err(ServerError::Protocol("empty pmt".into()));
        }
        let ptr = section[0] as usize;
        let table = &section[1 + ptr..];
        if table.len() < 16 || table[0] != 0x02 {
            return Err(ServerError::Protocol("bad pmt table".into()));
        }
        let section_len = u16::from_be_bytes([table[1] & 0x0f, table[2]]) as usize;
        let program_info_len = u16::from_be_bytes([table[10] & 0x0f, table[11]]) as usize;
        let entries_end = (3 + section_len).saturating_sub(4).min(table.len());

        let mut pos = 12 + program_info_len;
        while pos + 5 <= entries_end {
            let stream_type = table[pos];
            let pid = u16::from_be_bytes([table[pos + 1] & 0x1f, table[pos + 2]]);
            let es_info_len = u16::from_be_bytes([table[pos + 3] & 0x0f, table[pos + 4]]) as usize;
            match stream_type {
                STREAM_TYPE_H264 => self.video_pid = Some(pid),
                STREAM_TYPE_AAC => self.audio_pid = Some(pid),
                other => {
                    log::debug!("[TsDemux] ignoring stream type {:#04x} pid={}", other, pid)
                }
            }
            pos += 5 + es_info_len;
        }
        Ok(())
    }

    fn parse_pes(kind: PesKind, pid: u16, data: Bytes) -> ServerResult<Option<PesPacket>> {
        if data.len() < 9 {
            return Err(ServerError::Protocol("pes too short".into()));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return Err(ServerError::Protocol("pes start code missing".into()));
        }
        let flags = data[7];
        let header_len = data[8] as usize;
        if data.len() < 9 + header_len {
            return Err(ServerError::Protocol("pes header overrun".into()));
        }

        let pts = if flags & 0x80 != 0 {
            if header_len < 5 {
                return Err(ServerError::Protocol("pes pts header too short".into()));
            }
            Some(decode_ts90(&data[9..14])?)
        } else {
            None
        };
        let dts = if flags & 0x40 != 0 {
            if header_len < 10 {
                return Err(ServerError::Protocol("pes dts header too short".into()));
            }
            Some(decode_ts90(&data[14..19])?)
        } else {
            None
        };

        let payload = data.slice(9 + header_len..);
        if payload.is_empty() {
            return Ok(None);
        }
        let pts90 = pts.unwrap_or(0);
        let dts90 = dts.unwrap_or(pts90);
        Ok(Some(PesPacket {
            kind,
            pid,
            pts_ms: (pts90 / TS_UNITS_PER_MS) as i64,
            dts_ms: (dts90 / TS_UNITS_PER_MS) as i64,
            payload,
        }))
    }
}

fn decode_ts90(b: &[u8]) -> ServerResult<u64> {
    if b.len() < 5 {
        return Err(ServerError::Protocol("pes timestamp truncated".into()));
    }
    let ts = ((b[0] as u64 >> 1) & 0x07) << 30
        | (b[1] as u64) << 22
        | ((b[2] as u64 >> 1) & 0x7f) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64 >> 1) & 0x7f;
    Ok(ts)
}

fn encode_ts90(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8 & 0x7f) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8 & 0x7f) << 1) | 1,
    ]
}

/// MPEG CRC32 over PSI sections.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Multiplexes elementary streams into 188-byte TS packets for segments.
pub struct TsMuxer {
    video_cc: u8,
    audio_cc: u8,
    pat_cc: u8,
    pmt_cc: u8,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            video_cc: 0,
            audio_cc: 0,
            pat_cc: 0,
            pmt_cc: 0,
        }
    }

    fn psi_packet(pid: u16, cc: &mut u8, table: &[u8]) -> [u8; TS_PACKET_SIZE] {
        let mut pkt = [0xffu8; TS_PACKET_SIZE];
        pkt[0] = SYNC_BYTE;
        pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
        pkt[2] = pid as u8;
        pkt[3] = 0x10 | (*cc & 0x0f);
        *cc = cc.wrapping_add(1);
        pkt[4] = 0; // pointer_field
        pkt[5..5 + table.len()].copy_from_slice(table);
        pkt
    }

    /// The PAT packet announcing one program on [`PID_PMT`].
    pub fn pat(&mut self) -> [u8; TS_PACKET_SIZE] {
        let mut table = vec![
            0x00, // table_id
            0xb0,
            13, // section_length
            0x00,
            0x01, // transport_stream_id
            0xc1, // version 0, current
            0x00,
            0x00, // section numbers
            0x00,
            0x01, // program_number 1
            0xe0 | (PID_PMT >> 8) as u8,
            PID_PMT as u8,
        ];
        let crc = crc32(&table);
        table.extend_from_slice(&crc.to_be_bytes());
        Self::psi_packet(PID_PAT, &mut self.pat_cc, &table)
    }

    /// The PMT packet declaring the H.264 and AAC tracks.
    pub fn pmt(&mut self) -> [u8; TS_PACKET_SIZE] {
        let mut table = vec![
            0x02, // table_id
            0xb0,
            23, // section_length
            0x00,
            0x01, // program_number
            0xc1,
            0x00,
            0x00,
            0xe0 | (PID_VIDEO >> 8) as u8, // PCR PID
            PID_VIDEO as u8,
            0xf0,
            0x00, // program_info_length
            STREAM_TYPE_H264,
            0xe0 | (PID_VIDEO >> 8) as u8,
            PID_VIDEO as u8,
            0xf0,
            0x00,
            STREAM_TYPE_AAC,
            0xe0 | (PID_AUDIO >> 8) as u8,
            PID_AUDIO as u8,
            0xf0,
            0x00,
        ];
        let crc = crc32(&table);
        table.extend_from_slice(&crc.to_be_bytes());
        Self::psi_packet(PID_PMT, &mut self.pmt_cc, &table)
    }

    /// Packetizes one PES into TS packets.
    ///
    /// The first packet of a video PES with `with_pcr` carries the PCR in
    /// its adaptation field.
    pub fn write_pes(
        &mut self,
        kind: PesKind,
        pts_ms: i64,
        dts_ms: i64,
        payload: &[u8],
        with_pcr: bool,
    ) -> Vec<u8> {
        let (pid, stream_id, cc) = match kind {
            PesKind::Video => (PID_VIDEO, 0xe0u8, &mut self.video_cc),
            PesKind::Audio => (PID_AUDIO, 0xc0u8, &mut self.audio_cc),
        };

        let pts = pts_ms.max(0) as u64 * TS_UNITS_PER_MS;
        let dts = dts_ms.max(0) as u64 * TS_UNITS_PER_MS;
        let has_dts = dts != pts;

        // PES header.
        let mut pes = BytesMut::with_capacity(payload.len() + 19);
        pes.put_slice(&[0, 0, 1, stream_id]);
        let header_data_len = if has_dts { 10u8 } else { 5 };
        let pes_len = 3 + header_data_len as usize + payload.len();
        // Video PES may exceed the 16-bit length; zero means unbounded.
        pes.put_u16(if pes_len > 0xffff { 0 } else { pes_len as u16 });
        pes.put_u8(0x80);
        pes.put_u8(if has_dts { 0xc0 } else { 0x80 });
        pes.put_u8(header_data_len);
        pes.put_slice(&encode_ts90(if has_dts { 0x3 } else { 0x2 }, pts));
        if has_dts {
            pes.put_slice(&encode_ts90(0x1, dts));
        }
        pes.put_slice(payload);
        let pes = pes.freeze();

        let mut out = Vec::with_capacity((pes.len() / 184 + 1) * TS_PACKET_SIZE);
        let mut offset = 0usize;
        let mut first = true;
        while offset < pes.len() {
            let mut pkt = [0xffu8; TS_PACKET_SIZE];
            pkt[0] = SYNC_BYTE;
            pkt[1] = (if first { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1f);
            pkt[2] = pid as u8;

            let remaining = pes.len() - offset;
            let pcr_here = first && with_pcr && kind == PesKind::Video;

            // Adaptation field when carrying PCR or padding a short tail.
            let mut af: Vec<u8> = Vec::new();
            if pcr_here {
                let pcr_base = dts.max(1);
                af.push(0x10); // PCR flag
                af.push((pcr_base >> 25) as u8);
                af.push((pcr_base >> 17) as u8);
                af.push((pcr_base >> 9) as u8);
                af.push((pcr_base >> 1) as u8);
                af.push(((pcr_base as u8 & 0x01) << 7) | 0x7e);
                af.push(0);
            }

            let mut has_af = !af.is_empty();
            let af_overhead = if has_af { 1 + af.len() } else { 0 };
            let mut body_space = 184 - af_overhead;

            if remaining < body_space {
                // Stuff the adaptation field so the payload ends the packet.
                let stuffing = body_space - remaining;
                has_af = true;
                if af.is_empty() && stuffing >= 2 {
                    // Length byte + flags byte + 0xff filler.
                    af.push(0x00);
                    af.resize(stuffing - 1, 0xff);
                } else if !af.is_empty() {
                    af.resize(af.len() + stuffing, 0xff);
                }
                // A single stuffing byte is the zero length byte alone.
                body_space = 184 - 1 - af.len();
            }

            pkt[3] = (if has_af { 0x30 } else { 0x10 }) | (*cc & 0x0f);
            *cc = cc.wrapping_add(1);

            let mut pos = 4;
            if has_af {
                pkt[pos] = af.len() as u8;
                pos += 1;
                pkt[pos..pos + af.len()].copy_from_slice(&af);
                pos += af.len();
            }

            let n = remaining.min(body_space);
            pkt[pos..pos + n].copy_from_slice(&pes[offset..offset + n]);
            offset += n;
            first = false;
            out.extend_from_slice(&pkt);
        }
        out
    }
}

/// Parses an AudioSpecificConfig into (object type, frequency index,
/// channel configuration).
pub fn parse_audio_specific_config(asc: &[u8]) -> ServerResult<(u8, u8, u8)> {
    if asc.len() < 2 {
        return Err(ServerError::Protocol("asc too short".into()));
    }
    let aot = asc[0] >> 3;
    let freq = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
    let channels = (asc[1] >> 3) & 0x0f;
    Ok((aot, freq, channels))
}

/// Wraps one raw AAC frame in an ADTS header.
pub fn adts_frame(aot: u8, freq_index: u8, channels: u8, raw: &[u8]) -> Bytes {
    let frame_len = raw.len() + 7;
    let mut buf = BytesMut::with_capacity(frame_len);
    buf.put_u8(0xff);
    buf.put_u8(0xf1); // MPEG-4, layer 0, no CRC
    buf.put_u8(((aot.saturating_sub(1) & 0x03) << 6) | ((freq_index & 0x0f) << 2) | (channels >> 2));
    buf.put_u8(((channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03));
    buf.put_u8((frame_len >> 3) as u8);
    buf.put_u8(((frame_len as u8 & 0x07) << 5) | 0x1f);
    buf.put_u8(0xfc);
    buf.put_slice(raw);
    buf.freeze()
}

/// Splits an ADTS stream into raw AAC frames with their config.
pub fn adts_split(data: &Bytes) -> ServerResult<Vec<(u8, u8, u8, Bytes)>> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset + 7 <= data.len() {
        if data[offset] != 0xff || (data[offset + 1] & 0xf0) != 0xf0 {
            return Err(ServerError::Protocol("adts sync lost".into()));
        }
        let protection_absent = data[offset + 1] & 0x01 != 0;
        let aot = (data[offset + 2] >> 6) + 1;
        let freq = (data[offset + 2] >> 2) & 0x0f;
        let channels = ((data[offset + 2] & 0x01) << 2) | (data[offset + 3] >> 6);
        let frame_len = ((data[offset + 3] as usize & 0x03) << 11)
            | (data[offset + 4] as usize) << 3
            | (data[offset + 5] as usize) >> 5;
        if frame_len < 7 || offset + frame_len > data.len() {
            return Err(ServerError::Protocol("adts frame overrun".into()));
        }
        let header_len = if protection_absent { 7 } else { 9 };
        if frame_len < header_len {
            return Err(ServerError::Protocol("adts header overrun".into()));
        }
        frames.push((
            aot,
            freq,
            channels,
            data.slice(offset + header_len..offset + frame_len),
        ));
        offset += frame_len;
    }
    Ok(frames)
}

/// Builds the two-byte AudioSpecificConfig.
pub fn audio_specific_config(aot: u8, freq_index: u8, channels: u8) -> [u8; 2] {
    [
        (aot << 3) | (freq_index >> 1),
        ((freq_index & 0x01) << 7) | ((channels & 0x0f) << 3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(demux: &mut TsDemuxer, data: &[u8]) -> Vec<PesPacket> {
        let mut out = Vec::new();
        for chunk in data.chunks(TS_PACKET_SIZE) {
            out.extend(demux.on_packet(&Bytes::copy_from_slice(chunk)).unwrap());
        }
        out.extend(demux.flush().unwrap());
        out
    }

    #[test]
    fn mux_demux_round_trip_preserves_payload_and_timestamps() {
        let mut mux = TsMuxer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&mux.pat());
        wire.extend_from_slice(&mux.pmt());

        let es: Vec<u8> = [0u8, 0, 0, 1, 0x65]
            .iter()
            .copied()
            .chain((0..500).map(|i| i as u8))
            .collect();
        wire.extend(mux.write_pes(PesKind::Video, 140, 100, &es, true));

        let audio_es = adts_frame(2, 4, 2, &[0x21, 0x22, 0x23]);
        wire.extend(mux.write_pes(PesKind::Audio, 120, 120, &audio_es, false));

        let mut demux = TsDemuxer::new();
        let pes = feed_all(&mut demux, &wire);

        assert!(demux.is_ready());
        assert_eq!(pes.len(), 2);

        let video = pes.iter().find(|p| p.kind == PesKind::Video).unwrap();
        assert_eq!(video.pts_ms, 140);
        assert_eq!(video.dts_ms, 100);
        assert_eq!(video.payload.as_ref(), &es[..]);

        let audio = pes.iter().find(|p| p.kind == PesKind::Audio).unwrap();
        assert_eq!(audio.pts_ms, 120);
        assert_eq!(audio.dts_ms, 120);
        assert_eq!(audio.payload, audio_es);
    }

    #[test]
    fn pes_timestamp_codec_round_trips() {
        for ts in [0u64, 90_000, 0x1_0000_0000, (1u64 << 33) - 1] {
            let encoded = encode_ts90(0x2, ts);
            assert_eq!(decode_ts90(&encoded).unwrap(), ts);
        }
    }

    #[test]
    fn demuxer_rejects_bad_sync() {
        let mut demux = TsDemuxer::new();
        let bad = Bytes::from(vec![0x46u8; TS_PACKET_SIZE]);
        assert!(demux.on_packet(&bad).is_err());
    }

    #[test]
    fn demuxer_rejects_bad_size() {
        let mut demux = TsDemuxer::new();
        let bad = Bytes::from(vec![SYNC_BYTE; 100]);
        assert!(demux.on_packet(&bad).is_err());
    }

    #[test]
    fn adts_round_trip() {
        let raw = [0x11u8, 0x22, 0x33, 0x44];
        let framed = adts_frame(2, 4, 2, &raw);
        let frames = adts_split(&framed).unwrap();
        assert_eq!(frames.len(), 1);
        let (aot, freq, channels, payload) = &frames[0];
        assert_eq!((*aot, *freq, *channels), (2, 4, 2));
        assert_eq!(payload.as_ref(), &raw);
    }

    #[test]
    fn asc_round_trip() {
        let asc = audio_specific_config(2, 4, 2);
        let (aot, freq, channels) = parse_audio_specific_config(&asc).unwrap();
        assert_eq!((aot, freq, channels), (2, 4, 2));
    }

    #[test]
    fn large_pes_spans_many_packets() {
        let mut mux = TsMuxer::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&mux.pat());
        wire.extend_from_slice(&mux.pmt());

        let es: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        wire.extend(mux.write_pes(PesKind::Video, 1000, 1000, &es, true));
        assert_eq!(wire.len() % TS_PACKET_SIZE, 0);

        let mut demux = TsDemuxer::new();
        let pes = feed_all(&mut demux, &wire);
        assert_eq!(pes.len(), 1);
        assert_eq!(pes[0].payload.len(), es.len());
        assert_eq!(pes[0].payload.as_ref(), &es[..]);
    }
}
