//! Per-protocol publisher/player adapters.
//!
//! - [`rtmp`]: the RTMP server connection (handshake, identify, publish or
//!   play) and its TCP listener
//! - [`ts_udp`]: MPEG-TS over UDP ingest (the SRT-carried transport in
//!   production deployments)

pub mod rtmp;
pub mod ts_udp;

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::hub::{LiveSourceRegistry, RtcSourceRegistry, SrtSourceRegistry};
use crate::pithy::PithyPrints;
use crate::runtime::coroutine::TaskSpawner;
use crate::token::PublishTokenManager;

/// Everything a connection adapter needs, wired once at the composition
/// root and shared by every accepted client.
#[derive(Clone)]
pub struct AdapterContext {
    pub live: Arc<LiveSourceRegistry>,
    pub rtc: Arc<RtcSourceRegistry>,
    pub srt: Arc<SrtSourceRegistry>,
    pub tokens: Arc<PublishTokenManager>,
    pub prints: Arc<PithyPrints>,
    pub breaker: Arc<CircuitBreaker>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub clock: Arc<dyn Clock>,
    /// Whether RTMP publishers also feed the RTC domain.
    pub rtmp_to_rtc: bool,
}
