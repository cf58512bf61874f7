//! RTP packet codec and receiver-side loss bookkeeping.
//!
//! - [`packet`]: header marshal/unmarshal and wrap-aware sequence math
//! - [`h264`]: Annex-B / AVCC NALU utilities and the H.264 RTP payload kinds
//! - [`nack`]: gap tracking, retry/age accounting and the packet ring

pub mod h264;
pub mod nack;
pub mod packet;

pub use nack::{NackList, NackOptions, PacketRing, SequenceTracker};
pub use packet::{seq_distance, seq_newer, RtpHeader, RtpPacket};
