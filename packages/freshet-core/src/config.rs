//! Core server configuration.
//!
//! The binary loads YAML and env overrides into this structure; the
//! composition root wires it into the services. Vhost entries carry the
//! per-namespace feature toggles; unknown vhosts fall back to the default
//! entry, the way a client naming no vhost does.

use std::time::Duration;

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::hls::muxer::HlsConfig;
use crate::hub::live::ConsumerBounds;
use crate::request::DEFAULT_VHOST;

/// Per-vhost feature toggles.
#[derive(Debug, Clone, Deserialize)]
pub struct VhostConfig {
    pub name: String,
    /// Whether RTMP publishers also feed the RTC domain.
    #[serde(default)]
    pub rtmp_to_rtc: bool,
    /// Whether streams of this vhost are muxed to HLS.
    #[serde(default)]
    pub hls: bool,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_VHOST.into(),
            rtmp_to_rtc: false,
            hls: true,
        }
    }
}

/// The whole server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind listeners on ("" for wildcard).
    pub listen_host: String,
    /// RTMP listen port.
    pub rtmp_listen: u16,
    /// HTTP stream/API listen port.
    pub http_listen: u16,
    /// HTTP API port advertised to cluster peers.
    pub api_port: u16,
    /// UDP port for MPEG-TS ingest (0 disables).
    pub srt_listen: u16,
    /// Stream identity the TS ingest publishes as (`app/stream`).
    pub srt_stream: String,
    /// App assumed when a client names none.
    pub default_app: String,
    /// Pithy print interval.
    pub pithy_interval: Duration,
    /// Consumer queue bounds.
    pub consumer: ConsumerBounds,
    /// Idle timeout for HLS sessions.
    pub hls_session_timeout: Duration,
    /// Vhost table; the entry named `__defaultVhost__` is the fallback.
    pub vhosts: Vec<VhostConfig>,
    pub breaker: BreakerConfig,
    pub heartbeat: HeartbeatConfig,
    pub hls: HlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: String::new(),
            rtmp_listen: 1935,
            http_listen: 8080,
            api_port: 1985,
            srt_listen: 0,
            srt_stream: "live/livestream".into(),
            default_app: crate::request::DEFAULT_APP.into(),
            pithy_interval: Duration::from_secs(10),
            consumer: ConsumerBounds::default(),
            hls_session_timeout: Duration::from_secs(120),
            vhosts: vec![VhostConfig::default()],
            breaker: BreakerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hls: HlsConfig::default(),
        }
    }
}

impl Config {
    /// Looks up a vhost entry, falling back to the default.
    pub fn vhost(&self, name: &str) -> VhostConfig {
        self.vhosts
            .iter()
            .find(|v| v.name == name)
            .or_else(|| self.vhosts.iter().find(|v| v.name == DEFAULT_VHOST))
            .cloned()
            .unwrap_or_default()
    }

    /// Splits the configured TS ingest identity into app and stream.
    pub fn srt_app_stream(&self) -> (String, String) {
        match self.srt_stream.split_once('/') {
            Some((app, stream)) => (app.to_string(), stream.to_string()),
            None => (self.default_app.clone(), self.srt_stream.clone()),
        }
    }

    /// Validates ports and toggles that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.rtmp_listen == 0 {
            return Err("rtmp_listen must be set".into());
        }
        if self.http_listen == 0 {
            return Err("http_listen must be set".into());
        }
        if self.consumer.max_count == 0 {
            return Err("consumer.max_count must be >= 1".into());
        }
        if self.heartbeat.enabled && self.heartbeat.url.is_empty() {
            return Err("heartbeat.url required when heartbeat is enabled".into());
        }
        Ok(())
    }
}
