//! Byte-level wire protocols.
//!
//! - [`amf0`]: the AMF0 value encoding used by RTMP commands and metadata
//! - [`rtmp`]: handshake, chunk stream framing and message types
//! - [`flv`]: FLV header and tag serialization for HTTP-FLV delivery
//! - [`mpegts`]: 188-byte TS packets, PAT/PMT, PES demux and segment muxing

pub mod amf0;
pub mod flv;
pub mod mpegts;
pub mod rtmp;
