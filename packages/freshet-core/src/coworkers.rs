//! Cluster coworker directory.
//!
//! Tracks which streams this process currently holds so a peer server can
//! redirect a client to the right origin. `dumps` answers the cluster API
//! query with the service endpoint for a stream, or JSON null when the
//! stream is unknown here.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::context::NetworkContext;
use crate::hub::SourceEventHandler;
use crate::request::StreamRequest;

/// Loopback names never advertised to peers.
const LOCALHOST: &str = "localhost";
const LOOPBACK4: &str = "127.0.0.1";
const LOOPBACK6: &str = "::1";

/// In-memory map of published streams for redirect hints.
pub struct CoworkerDirectory {
    network: NetworkContext,
    /// Listen host from configuration ("" when wildcard).
    listen_host: String,
    /// RTMP listen port advertised to peers.
    listen_port: u16,
    /// HTTP API endpoint advertised in `api` and `routers`.
    api_port: u16,
    streams: Mutex<HashMap<String, StreamRequest>>,
}

impl CoworkerDirectory {
    /// Creates the directory.
    pub fn new(
        network: NetworkContext,
        listen_host: impl Into<String>,
        listen_port: u16,
        api_port: u16,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            network,
            listen_host: listen_host.into(),
            listen_port,
            api_port,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Number of published streams tracked.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether no streams are tracked.
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    fn find_stream(&self, vhost: &str, app: &str, stream: &str) -> Option<StreamRequest> {
        let url = format!("{}/{}/{}", vhost, app, stream);
        self.streams.lock().get(&url).cloned()
    }

    /// The IP peers should use to reach this process.
    ///
    /// Order: explicit non-loopback listen host, else the coworker-provided
    /// host from the query, else the discovered local IP.
    fn service_ip(&self, coworker: &str) -> String {
        let host = self.listen_host.as_str();
        if !host.is_empty() && host != LOCALHOST && host != LOOPBACK4 && host != LOOPBACK6 {
            return host.to_string();
        }

        let coworker_host = coworker.split(':').next().unwrap_or("");
        if !coworker_host.is_empty() {
            return coworker_host.to_string();
        }

        self.network.get_local_ip()
    }

    /// The redirect hint for a stream, or JSON null when unknown.
    pub fn dumps(&self, vhost: &str, coworker: &str, app: &str, stream: &str) -> Value {
        let Some(req) = self.find_stream(vhost, app, stream) else {
            return Value::Null;
        };

        let service_ip = self.service_ip(coworker);
        let backend = format!("{}:{}", service_ip, self.api_port);

        log::info!(
            "[Coworkers] redirect vhost={}, path={}/{} to ip={}, port={}, api={}",
            vhost,
            app,
            stream,
            service_ip,
            self.listen_port,
            backend
        );

        json!({
            "ip": service_ip,
            "port": self.listen_port,
            "vhost": req.vhost,
            "api": backend,
            "routers": [backend],
        })
    }
}

impl SourceEventHandler for CoworkerDirectory {
    fn on_publish(&self, req: &StreamRequest) {
        // Always keep the latest snapshot.
        self.streams.lock().insert(req.stream_url(), req.clone());
    }

    fn on_unpublish(&self, req: &StreamRequest) {
        self.streams.lock().remove(&req.stream_url());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn network() -> NetworkContext {
        NetworkContext::explicit(1935, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)))
    }

    fn req(stream: &str) -> StreamRequest {
        let mut r = StreamRequest::new("rtmp", "example.com", "live", stream, 1935);
        r.vhost = "demo.example.com".into();
        r
    }

    #[test]
    fn publish_replaces_and_unpublish_removes() {
        let dir = CoworkerDirectory::new(network(), "", 1935, 1985);
        dir.on_publish(&req("x"));
        assert_eq!(dir.len(), 1);

        // Latest snapshot wins.
        let mut newer = req("x");
        newer.param = "attempt=2".into();
        dir.on_publish(&newer);
        assert_eq!(dir.len(), 1);

        dir.on_unpublish(&req("x"));
        assert!(dir.is_empty());
    }

    #[test]
    fn dumps_unknown_stream_is_null() {
        let dir = CoworkerDirectory::new(network(), "", 1935, 1985);
        assert_eq!(dir.dumps("demo.example.com", "", "live", "nope"), Value::Null);
    }

    #[test]
    fn dumps_uses_explicit_listen_host_first() {
        let dir = CoworkerDirectory::new(network(), "origin.example.com", 19350, 1985);
        dir.on_publish(&req("x"));

        let hint = dir.dumps("demo.example.com", "10.0.0.9:1935", "live", "x");
        assert_eq!(hint["ip"], "origin.example.com");
        assert_eq!(hint["port"], 19350);
        assert_eq!(hint["vhost"], "demo.example.com");
        assert_eq!(hint["api"], "origin.example.com:1985");
        assert_eq!(hint["routers"][0], "origin.example.com:1985");
    }

    #[test]
    fn dumps_falls_back_to_coworker_then_local_ip() {
        // Loopback listen host is ignored.
        let dir = CoworkerDirectory::new(network(), "127.0.0.1", 1935, 1985);
        dir.on_publish(&req("x"));

        let via_coworker = dir.dumps("demo.example.com", "10.0.0.9:1935", "live", "x");
        assert_eq!(via_coworker["ip"], "10.0.0.9");

        let via_local = dir.dumps("demo.example.com", "", "live", "x");
        assert_eq!(via_local["ip"], "192.168.1.50");
    }
}
