//! Freshet Core - shared library for the Freshet media server.
//!
//! This crate provides the core of a live-streaming media server: one
//! process ingests real-time audio/video from publishers (RTMP, MPEG-TS
//! over UDP/SRT, RTP) and multicasts it to subscribers over RTMP,
//! HTTP-FLV, HLS and RTC. It is designed to be embedded by the headless
//! server binary and by tests.
//!
//! # Architecture
//!
//! - [`runtime`]: cooperative coroutines, conditions, timers, async worker
//! - [`hub`]: per-URL sources fanning frames/packets out to consumers
//! - [`bridge`]: cross-protocol repacketization between the domains
//! - [`protocol`]: RTMP chunking, AMF0, FLV, MPEG-TS at byte level
//! - [`rtp`] / [`rtcp`]: RTP codec, loss bookkeeping, NACK/PLI feedback
//! - [`conn`]: per-protocol publisher/player adapters
//! - [`hls`]: segment rotation, playlist writing, player sessions
//! - [`bootstrap`]: the single composition root wiring everything
//!
//! # Abstraction traits
//!
//! Substitutable collaborators keep the core testable: [`clock::Clock`]
//! for time, [`context::IpDetector`] for IP discovery,
//! [`breaker::CpuSource`] for process load,
//! [`runtime::coroutine::TaskSpawner`] for task spawning and
//! [`rtc::conn::RtcpSink`] for feedback transport.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod breaker;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod conn;
pub mod context;
pub mod coworkers;
pub mod error;
pub mod heartbeat;
pub mod hls;
pub mod hub;
pub mod kbps;
pub mod packet;
pub mod pithy;
pub mod protocol;
pub mod request;
pub mod resource;
pub mod rtc;
pub mod rtcp;
pub mod rtp;
pub mod runtime;
pub mod token;

// Re-export commonly used types at the crate root.
pub use bootstrap::{bootstrap_services, Services};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use clock::{Clock, TokioClock};
pub use config::{Config, VhostConfig};
pub use context::{ContextId, IpDetector, LocalIpDetector, NetworkContext, NetworkError};
pub use error::{ErrorCode, ServerError, ServerResult};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use hls::{HlsConfig, HlsController};
pub use hub::{LiveConsumer, LiveSource, LiveSourceRegistry, RtcSource, SrtSource};
pub use packet::{MediaPacket, PacketKind};
pub use request::StreamRequest;
pub use runtime::{Coroutine, TaskSpawner, TokioSpawner};
pub use token::{PublishToken, PublishTokenManager};

// Re-export API types.
pub use api::{start_server, AppState};
