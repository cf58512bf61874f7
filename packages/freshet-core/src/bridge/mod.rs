//! Cross-protocol stream bridges.
//!
//! A bridge adapts one protocol domain to another: frames from an RTMP
//! publisher become RTP packets for RTC players, RTP from an RTC publisher
//! becomes frames for RTMP/FLV/HLS players, and MPEG-TS from an SRT
//! publisher becomes frames for both. Bridges sit between a publisher's
//! source and the sources of the other domains and run synchronously on the
//! publish path, before consumers.
//!
//! - [`rtp_builder`]: frame → RTP packetization (STAP-A, FU-A, single NAL)
//! - [`frame_builder`]: RTP → frame reassembly with keyframe recovery
//! - [`ts_builder`]: MPEG-TS demux → frames with DTS/PTS from PES

pub mod frame_builder;
pub mod rtp_builder;
pub mod ts_builder;

use std::sync::Arc;

use crate::error::ServerResult;
use crate::packet::MediaPacket;
use crate::request::StreamRequest;
use crate::rtp::RtpPacket;

pub use frame_builder::FrameBuilder;
pub use rtp_builder::RtpBuilder;
pub use ts_builder::TsFrameBuilder;

/// A target fed with AV frames: a live source, or a bridge that converts
/// frames to another packet format.
pub trait FrameTarget: Send + Sync {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()>;
}

/// A target fed with RTP packets: an RTC source, or a bridge that converts
/// RTP packets to frames.
pub trait RtpTarget: Send + Sync {
    fn on_rtp(&self, pkt: &Arc<RtpPacket>) -> ServerResult<()>;
}

/// A frame-domain bridge with a publish lifecycle.
///
/// `on_publish`/`on_unpublish` must be paired per source lifecycle;
/// transient conversion errors inside `on_frame` are logged and dropped by
/// the implementation, never surfaced as publisher failures.
pub trait StreamBridge: FrameTarget {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()>;
    fn on_publish(&self) -> ServerResult<()>;
    fn on_unpublish(&self);
}

/// An RTP-domain bridge with a publish lifecycle.
pub trait RtpBridge: RtpTarget {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()>;
    fn on_publish(&self) -> ServerResult<()>;
    fn on_unpublish(&self);
}

/// A target fed with raw MPEG-TS data from an SRT/UDP transport.
pub trait SrtTarget: Send + Sync {
    fn on_packet(&self, data: &bytes::Bytes) -> ServerResult<()>;
}

/// A TS-domain bridge with a publish lifecycle.
pub trait SrtBridge: SrtTarget {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()>;
    fn on_publish(&self) -> ServerResult<()>;
    fn on_unpublish(&self);
}

/// A list of bridges applied in registration order.
///
/// The first failing child short-circuits frame delivery and returns the
/// error to the publisher's error path.
#[derive(Default)]
pub struct CompositeBridge {
    bridges: Vec<Arc<dyn StreamBridge>>,
}

impl CompositeBridge {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self {
            bridges: Vec::new(),
        }
    }

    /// Appends a child bridge.
    pub fn append(mut self, bridge: Arc<dyn StreamBridge>) -> Self {
        self.bridges.push(bridge);
        self
    }

    /// Whether no children are attached.
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

impl FrameTarget for CompositeBridge {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        for bridge in &self.bridges {
            bridge.on_frame(frame)?;
        }
        Ok(())
    }
}

impl StreamBridge for CompositeBridge {
    fn initialize(&self, req: &StreamRequest) -> ServerResult<()> {
        for bridge in &self.bridges {
            bridge.initialize(req)?;
        }
        Ok(())
    }

    fn on_publish(&self) -> ServerResult<()> {
        for bridge in &self.bridges {
            bridge.on_publish()?;
        }
        Ok(())
    }

    fn on_unpublish(&self) {
        for bridge in &self.bridges {
            bridge.on_unpublish();
        }
    }
}
