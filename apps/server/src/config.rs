//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind listeners to ("" binds all interfaces).
    pub listen_host: String,

    /// RTMP listen port.
    /// Override: `FRESHET_RTMP_PORT`
    pub rtmp_port: u16,

    /// HTTP stream/API listen port.
    /// Override: `FRESHET_HTTP_PORT`
    pub http_port: u16,

    /// API port advertised to cluster peers.
    pub api_port: u16,

    /// UDP port for MPEG-TS ingest; 0 disables the caster.
    pub srt_port: u16,

    /// Stream identity the TS ingest publishes as (`app/stream`).
    pub srt_stream: String,

    /// IP address to advertise to peers and heartbeat targets.
    /// If not specified, auto-detection will be attempted.
    /// Override: `FRESHET_ADVERTISE_IP`
    pub advertise_ip: Option<IpAddr>,

    /// Whether RTMP publishers also feed the RTC domain.
    pub rtmp_to_rtc: bool,

    /// HLS output settings.
    pub hls: HlsSection,

    /// Heartbeat settings.
    pub heartbeat: HeartbeatSection,

    /// Circuit breaker settings.
    pub circuit_breaker: BreakerSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HlsSection {
    pub enabled: bool,
    /// Segment target duration in seconds.
    pub fragment_secs: u64,
    /// Playlist window in seconds.
    pub window_secs: u64,
    /// Directory segments are written under.
    pub path: PathBuf,
    /// Whether unpublish deletes the stream's files.
    pub cleanup: bool,
}

impl Default for HlsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            fragment_secs: 6,
            window_secs: 30,
            path: PathBuf::from("./html"),
            cleanup: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HeartbeatSection {
    pub enabled: bool,
    pub url: String,
    pub device_id: String,
    pub interval_secs: u64,
    pub summaries: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub enabled: bool,
    pub high_threshold: i32,
    pub high_pulse: i32,
    pub critical_threshold: i32,
    pub critical_pulse: i32,
    pub dying_threshold: i32,
    pub dying_pulse: i32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let d = freshet_core::BreakerConfig::default();
        Self {
            enabled: d.enabled,
            high_threshold: d.high_threshold,
            high_pulse: d.high_pulse,
            critical_threshold: d.critical_threshold,
            critical_pulse: d.critical_pulse,
            dying_threshold: d.dying_threshold,
            dying_pulse: d.dying_pulse,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: String::new(),
            rtmp_port: 1935,
            http_port: 8080,
            api_port: 1985,
            srt_port: 0,
            srt_stream: "live/livestream".into(),
            advertise_ip: None,
            rtmp_to_rtc: false,
            hls: HlsSection::default(),
            heartbeat: HeartbeatSection::default(),
            circuit_breaker: BreakerSection::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FRESHET_RTMP_PORT") {
            if let Ok(port) = val.parse() {
                self.rtmp_port = port;
            }
        }

        if let Ok(val) = std::env::var("FRESHET_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                self.http_port = port;
            }
        }

        if let Ok(val) = std::env::var("FRESHET_ADVERTISE_IP") {
            if let Ok(ip) = val.parse() {
                self.advertise_ip = Some(ip);
            }
        }
    }

    /// Converts to freshet-core's Config type.
    pub fn to_core_config(&self) -> freshet_core::Config {
        let mut config = freshet_core::Config {
            listen_host: self.listen_host.clone(),
            rtmp_listen: self.rtmp_port,
            http_listen: self.http_port,
            api_port: self.api_port,
            srt_listen: self.srt_port,
            srt_stream: self.srt_stream.clone(),
            ..Default::default()
        };

        config.vhosts = vec![freshet_core::VhostConfig {
            name: freshet_core::request::DEFAULT_VHOST.into(),
            rtmp_to_rtc: self.rtmp_to_rtc,
            hls: self.hls.enabled,
        }];

        config.hls = freshet_core::HlsConfig {
            enabled: self.hls.enabled,
            fragment_ms: self.hls.fragment_secs as i64 * 1000,
            window_ms: self.hls.window_secs as i64 * 1000,
            path: self.hls.path.clone(),
            cleanup: self.hls.cleanup,
            ..Default::default()
        };

        config.heartbeat = freshet_core::HeartbeatConfig {
            enabled: self.heartbeat.enabled,
            url: self.heartbeat.url.clone(),
            device_id: self.heartbeat.device_id.clone(),
            interval: Duration::from_secs(self.heartbeat.interval_secs.max(1)),
            summaries: self.heartbeat.summaries,
            ports: true,
        };

        config.breaker = freshet_core::BreakerConfig {
            enabled: self.circuit_breaker.enabled,
            high_threshold: self.circuit_breaker.high_threshold,
            high_pulse: self.circuit_breaker.high_pulse,
            critical_threshold: self.circuit_breaker.critical_threshold,
            critical_pulse: self.circuit_breaker.critical_pulse,
            dying_threshold: self.circuit_breaker.dying_threshold,
            dying_pulse: self.circuit_breaker.dying_pulse,
        };

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_to_valid_core_config() {
        let config = ServerConfig::default().to_core_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.rtmp_listen, 1935);
    }

    #[test]
    fn yaml_sections_parse() {
        let yaml = r#"
rtmp_port: 19350
srt_port: 10080
rtmp_to_rtc: true
hls:
  enabled: true
  fragment_secs: 4
heartbeat:
  enabled: true
  url: http://example.com/hb
  interval_secs: 30
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rtmp_port, 19350);
        assert_eq!(config.srt_port, 10080);
        assert!(config.rtmp_to_rtc);
        assert_eq!(config.hls.fragment_secs, 4);
        assert!(config.heartbeat.enabled);

        let core = config.to_core_config();
        assert!(core.validate().is_ok());
        assert_eq!(core.hls.fragment_ms, 4000);
        assert_eq!(core.heartbeat.interval, Duration::from_secs(30));
    }
}
