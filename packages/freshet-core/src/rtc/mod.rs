//! Per-peer RTC session plumbing.
//!
//! - [`track`]: receive tracks with NACK bookkeeping, send tracks with
//!   marker policy
//! - [`conn`]: the per-connection timer hook emitting RTCP NACKs, and the
//!   PLI worker batching keyframe requests

pub mod conn;
pub mod track;

pub use conn::{PliWorker, RtcConnection, RtcPlayStream, RtcpSink, RtpSink};
pub use track::{RecvTrack, SendTrack, TrackKind};
