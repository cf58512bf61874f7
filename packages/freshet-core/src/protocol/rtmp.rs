//! RTMP handshake and chunk stream framing.
//!
//! The codec is buffer-driven: the connection reads bytes off its socket
//! into a [`BytesMut`] and asks the [`ChunkDecoder`] for complete messages,
//! so the framing logic stays independent of I/O and fully testable. Chunk
//! headers come in the four formats (11/7/3/0 bytes after the basic
//! header), with extended timestamps once the 24-bit field saturates at
//! 0xFFFFFF, and the chunk size is negotiable in both directions.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ServerError, ServerResult};
use crate::protocol::amf0::Amf0Value;

/// Chunk size both sides start with.
pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Chunk size this server announces after connect.
pub const OUT_CHUNK_SIZE: usize = 60000;
/// Timestamp value signalling an extended timestamp field.
const EXTENDED_TS: u32 = 0xFF_FFFF;
const HANDSHAKE_SIZE: usize = 1536;

/// RTMP message type ids.
pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const AMF3_COMMAND: u8 = 17;
    pub const AMF0_DATA: u8 = 18;
    pub const AMF0_COMMAND: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

/// Well-known chunk stream ids this server sends on.
pub mod csid {
    pub const PROTOCOL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const MEDIA: u32 = 4;
}

/// One complete RTMP message, reassembled from chunks.
#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub message_type: u8,
    /// Absolute timestamp in milliseconds.
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn is_audio(&self) -> bool {
        self.message_type == msg_type::AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == msg_type::VIDEO
    }

    pub fn is_amf0_command(&self) -> bool {
        self.message_type == msg_type::AMF0_COMMAND
    }

    pub fn is_amf0_data(&self) -> bool {
        self.message_type == msg_type::AMF0_DATA
    }
}

/// Per-chunk-stream decode state.
#[derive(Default)]
struct ChunkStream {
    timestamp: u32,
    ts_delta: u32,
    msg_len: usize,
    msg_type: u8,
    stream_id: u32,
    extended: bool,
    partial: BytesMut,
}

/// Reassembles messages from interleaved chunks.
pub struct ChunkDecoder {
    in_chunk_size: usize,
    streams: HashMap<u32, ChunkStream>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Applies a peer's Set Chunk Size.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.in_chunk_size = size.clamp(1, 0x7fff_ffff);
    }

    /// The current inbound chunk size.
    pub fn chunk_size(&self) -> usize {
        self.in_chunk_size
    }

    /// Consumes as many whole chunks as the buffer holds; returns the next
    /// complete message, or `None` when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ServerResult<Option<RtmpMessage>> {
        loop {
            let Some((consumed, message)) = self.try_chunk(buf)? else {
                return Ok(None);
            };
            let _ = buf.split_to(consumed);
            if let Some(message) = message {
                return Ok(Some(message));
            }
        }
    }

    /// Attempts to parse one chunk without consuming; returns the byte
    /// count to consume and the completed message, if any.
    fn try_chunk(&mut self, buf: &BytesMut) -> ServerResult<Option<(usize, Option<RtmpMessage>)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Basic header: 1, 2 or 3 bytes.
        let b0 = buf[0];
        let fmt = b0 >> 6;
        let (bh_len, chunk_id) = match b0 & 0x3f {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (2, 64 + buf[1] as u32)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (3, 64 + buf[1] as u32 + (buf[2] as u32) * 256)
            }
            id => (1, id as u32),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < bh_len + header_len {
            return Ok(None);
        }
        let header = &buf[bh_len..bh_len + header_len];

        let stream = self.streams.entry(chunk_id).or_default();
        if fmt == 3 && stream.msg_len == 0 {
            return Err(ServerError::Protocol(format!(
                "fmt3 chunk on fresh chunk stream {}",
                chunk_id
            )));
        }

        let ts_field = if header_len >= 3 {
            u32::from_be_bytes([0, header[0], header[1], header[2]])
        } else {
            0
        };

        match fmt {
            0 => {
                stream.msg_len =
                    u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                stream.msg_type = header[6];
                stream.stream_id =
                    u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
            }
            1 => {
                stream.msg_len =
                    u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                stream.msg_type = header[6];
            }
            _ => {}
        }

        let has_extended = if fmt < 3 {
            stream.extended = ts_field == EXTENDED_TS;
            stream.extended
        } else {
            stream.extended
        };

        let total_header = bh_len + header_len + if has_extended { 4 } else { 0 };
        if buf.len() < total_header {
            return Ok(None);
        }

        let real_ts = if has_extended {
            u32::from_be_bytes([
                buf[total_header - 4],
                buf[total_header - 3],
                buf[total_header - 2],
                buf[total_header - 1],
            ])
        } else {
            ts_field
        };

        // A message starts with this chunk: apply the timestamp rules.
        if stream.partial.is_empty() {
            match fmt {
                0 => {
                    stream.timestamp = real_ts;
                    stream.ts_delta = 0;
                }
                1 | 2 => {
                    stream.ts_delta = real_ts;
                    stream.timestamp = stream.timestamp.wrapping_add(real_ts);
                }
                _ => {
                    stream.timestamp = stream.timestamp.wrapping_add(stream.ts_delta);
                }
            }
        }

        let remaining = stream.msg_len.checked_sub(stream.partial.len()).ok_or_else(|| {
            ServerError::Protocol(format!("chunk stream {} shrank mid-message", chunk_id))
        })?;
        let chunk_payload = remaining.min(self.in_chunk_size);
        if buf.len() < total_header + chunk_payload {
            return Ok(None);
        }

        stream
            .partial
            .extend_from_slice(&buf[total_header..total_header + chunk_payload]);

        let message = if stream.partial.len() == stream.msg_len {
            let payload = std::mem::take(&mut stream.partial).freeze();
            Some(RtmpMessage {
                message_type: stream.msg_type,
                timestamp: stream.timestamp,
                stream_id: stream.stream_id,
                payload,
            })
        } else {
            None
        };

        Ok(Some((total_header + chunk_payload, message)))
    }
}

/// Serializes messages into chunk streams.
pub struct ChunkEncoder {
    out_chunk_size: usize,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            out_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Applies our own announced chunk size.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.out_chunk_size = size.clamp(1, 0x7fff_ffff);
    }

    /// Serializes one message as an fmt0 chunk plus fmt3 continuations.
    pub fn encode(&self, chunk_id: u32, msg: &RtmpMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(msg.payload.len() + 32);
        let extended = msg.timestamp >= EXTENDED_TS;
        let ts_field = if extended { EXTENDED_TS } else { msg.timestamp };

        let put_basic = |buf: &mut BytesMut, fmt: u8| {
            if chunk_id < 64 {
                buf.put_u8((fmt << 6) | chunk_id as u8);
            } else if chunk_id < 320 {
                buf.put_u8(fmt << 6);
                buf.put_u8((chunk_id - 64) as u8);
            } else {
                buf.put_u8((fmt << 6) | 1);
                let id = chunk_id - 64;
                buf.put_u8((id % 256) as u8);
                buf.put_u8((id / 256) as u8);
            }
        };

        put_basic(&mut buf, 0);
        buf.put_slice(&ts_field.to_be_bytes()[1..]);
        buf.put_slice(&(msg.payload.len() as u32).to_be_bytes()[1..]);
        buf.put_u8(msg.message_type);
        buf.put_u32_le(msg.stream_id);
        if extended {
            buf.put_u32(msg.timestamp);
        }

        let mut offset = 0usize;
        loop {
            let n = (msg.payload.len() - offset).min(self.out_chunk_size);
            buf.put_slice(&msg.payload[offset..offset + n]);
            offset += n;
            if offset >= msg.payload.len() {
                break;
            }
            put_basic(&mut buf, 3);
            if extended {
                buf.put_u32(msg.timestamp);
            }
        }
        buf.freeze()
    }
}

/// Builds a Set Chunk Size protocol message.
pub fn set_chunk_size_message(size: u32) -> RtmpMessage {
    RtmpMessage {
        message_type: msg_type::SET_CHUNK_SIZE,
        timestamp: 0,
        stream_id: 0,
        payload: Bytes::copy_from_slice(&size.to_be_bytes()),
    }
}

/// Builds a Window Acknowledgement Size protocol message.
pub fn window_ack_size_message(size: u32) -> RtmpMessage {
    RtmpMessage {
        message_type: msg_type::WINDOW_ACK_SIZE,
        timestamp: 0,
        stream_id: 0,
        payload: Bytes::copy_from_slice(&size.to_be_bytes()),
    }
}

/// Builds a Set Peer Bandwidth protocol message (dynamic limit).
pub fn set_peer_bandwidth_message(size: u32) -> RtmpMessage {
    let mut payload = BytesMut::with_capacity(5);
    payload.put_u32(size);
    payload.put_u8(2);
    RtmpMessage {
        message_type: msg_type::SET_PEER_BANDWIDTH,
        timestamp: 0,
        stream_id: 0,
        payload: payload.freeze(),
    }
}

/// Builds an AMF0 command message.
pub fn command_message(stream_id: u32, values: &[Amf0Value]) -> RtmpMessage {
    RtmpMessage {
        message_type: msg_type::AMF0_COMMAND,
        timestamp: 0,
        stream_id,
        payload: Amf0Value::encode_all(values),
    }
}

/// Serves the plain (non-digest) RTMP handshake: reads C0C1, writes
/// S0S1S2, reads C2.
pub async fn serve_handshake<S>(io: &mut S) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
    io.read_exact(&mut c0c1).await.map_err(map_eof)?;
    if c0c1[0] != 0x03 {
        return Err(ServerError::Protocol(format!(
            "rtmp handshake version {:#04x}",
            c0c1[0]
        )));
    }

    // S0 + S1: version, time, zeros, pseudo-random filler.
    let mut s0s1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    s0s1.push(0x03);
    s0s1.extend_from_slice(&[0u8; 8]);
    s0s1.extend((0..HANDSHAKE_SIZE - 8).map(|i| (i * 7 + 13) as u8));
    io.write_all(&s0s1).await?;

    // S2 echoes C1.
    io.write_all(&c0c1[1..]).await?;
    io.flush().await?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    io.read_exact(&mut c2).await.map_err(map_eof)?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> ServerError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ServerError::Eof("rtmp handshake".into())
    } else {
        ServerError::Io(err)
    }
}
