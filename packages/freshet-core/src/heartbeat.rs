//! Outbound process heartbeat.
//!
//! Periodically POSTs a JSON envelope describing this server to a
//! configured HTTP endpoint. Failures are logged and swallowed; monitoring
//! must never take the media path down with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::{ContextId, NetworkContext};
use crate::error::{ServerError, ServerResult};
use crate::runtime::timer::{Hourglass, HourglassHandler};

/// Env var overriding the reported device IP.
pub const DEVICE_IP_ENV: &str = "FRESHET_DEVICE_IP";

/// Heartbeat settings from configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub url: String,
    pub device_id: String,
    pub interval: Duration,
    /// Whether to attach the summaries object.
    pub summaries: bool,
    /// Whether to attach the per-protocol listen arrays.
    pub ports: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            device_id: String::new(),
            interval: Duration::from_secs(10),
            summaries: false,
            ports: true,
        }
    }
}

/// The listen endpoints advertised in the envelope.
#[derive(Debug, Clone, Default)]
pub struct ListenSummary {
    pub rtmp: Vec<String>,
    pub http: Vec<String>,
    pub api: Vec<String>,
    pub srt: Vec<String>,
}

/// Source of the optional summaries payload.
pub trait SummaryProvider: Send + Sync {
    fn summaries(&self) -> Value;
}

/// The heartbeat task; subscribe it to an hourglass.
pub struct Heartbeat {
    config: HeartbeatConfig,
    network: NetworkContext,
    listens: ListenSummary,
    client: reqwest::Client,
    server_id: ContextId,
    service_id: ContextId,
    summary_provider: Option<Arc<dyn SummaryProvider>>,
}

impl Heartbeat {
    /// Hourglass event id for the heartbeat tick.
    pub const TICK_EVENT: u32 = 1;

    pub fn new(
        config: HeartbeatConfig,
        network: NetworkContext,
        listens: ListenSummary,
        client: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            network,
            listens,
            client,
            server_id: ContextId::new(),
            service_id: ContextId::new(),
            summary_provider: None,
        })
    }

    /// Attaches a summaries source.
    pub fn with_summaries(mut self: Arc<Self>, provider: Arc<dyn SummaryProvider>) -> Arc<Self> {
        if let Some(this) = Arc::get_mut(&mut self) {
            this.summary_provider = Some(provider);
        }
        self
    }

    /// Registers the tick on the hourglass.
    pub fn schedule(self: &Arc<Self>, hourglass: &Arc<Hourglass>) {
        if !self.config.enabled {
            return;
        }
        hourglass.tick(Self::TICK_EVENT, self.config.interval);
    }

    fn device_ip(&self) -> String {
        std::env::var(DEVICE_IP_ENV).unwrap_or_else(|_| self.network.get_local_ip())
    }

    /// Builds the JSON envelope.
    pub fn envelope(&self) -> Value {
        let device_id = if self.config.device_id.is_empty() {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            self.config.device_id.clone()
        };

        let mut obj = json!({
            "device_id": device_id,
            "ip": self.device_ip(),
            "server": self.server_id,
            "service": self.service_id,
            "pid": std::process::id().to_string(),
        });

        if self.config.summaries {
            if let Some(provider) = &self.summary_provider {
                obj["summaries"] = provider.summaries();
            }
        }

        if self.config.ports {
            obj["rtmp"] = json!(self.listens.rtmp);
            if !self.listens.http.is_empty() {
                obj["http"] = json!(self.listens.http);
            }
            if !self.listens.api.is_empty() {
                obj["api"] = json!(self.listens.api);
            }
            if !self.listens.srt.is_empty() {
                obj["srt"] = json!(self.listens.srt);
            }
        }

        obj
    }

    async fn beat(&self) -> ServerResult<()> {
        let envelope = self.envelope();
        let response = self
            .client
            .post(&self.config.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| ServerError::Internal(format!("heartbeat post: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServerError::Internal(format!(
                "heartbeat status {}",
                response.status()
            )));
        }
        log::debug!("[Heartbeat] ok url={}", self.config.url);
        Ok(())
    }
}

#[async_trait]
impl HourglassHandler for Heartbeat {
    async fn notify(&self, event: u32, _interval: Duration, _tick: Duration) -> ServerResult<()> {
        if event != Self::TICK_EVENT || !self.config.enabled {
            return Ok(());
        }
        // Failures never propagate: log and carry on.
        if let Err(err) = self.beat().await {
            log::warn!("[Heartbeat] {}", err);
        }
        Ok(())
    }
}
