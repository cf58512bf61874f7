//! Stream identity: who is publishing or playing what.
//!
//! A [`StreamRequest`] is created during a connection's handshake, copied
//! into the source hub on publish, and dropped on teardown. The triple
//! `vhost/app/stream` uniquely identifies a source across every protocol
//! domain.

use std::collections::HashMap;

use serde::Serialize;

/// Default app name when a client omits one.
pub const DEFAULT_APP: &str = "live";
/// Default vhost when a client names none.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// The identity of one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    /// Wire protocol of the request ("rtmp", "srt", "rtc", "flv", "hls").
    pub schema: String,
    /// TCP host the client connected to.
    pub host: String,
    /// Logical namespace; defaults to the host.
    pub vhost: String,
    /// Application name.
    pub app: String,
    /// Stream name.
    pub stream: String,
    /// Listen port the client connected to.
    pub port: u16,
    /// Free-form query string from the play/publish URL.
    pub param: String,
    /// Extra arguments carried alongside the request.
    pub args: HashMap<String, String>,
}

impl StreamRequest {
    /// Creates a request with vhost defaulted to the host.
    pub fn new(
        schema: impl Into<String>,
        host: impl Into<String>,
        app: impl Into<String>,
        stream: impl Into<String>,
        port: u16,
    ) -> Self {
        let host = host.into();
        Self {
            schema: schema.into(),
            vhost: host.clone(),
            host,
            app: app.into(),
            stream: stream.into(),
            port,
            param: String::new(),
            args: HashMap::new(),
        }
    }

    /// Parses the query string and applies a `vhost=` override if present.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        if let Some(vhost) = query_value(&self.param, "vhost") {
            if !vhost.is_empty() {
                self.vhost = vhost;
            }
        }
        self
    }

    /// The unique source key `vhost/app/stream`.
    pub fn stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    /// Short printable form for logs.
    pub fn desc(&self) -> String {
        format!(
            "{}://{}:{}/{}/{}{}{}",
            self.schema,
            self.host,
            self.port,
            self.app,
            self.stream,
            if self.param.is_empty() { "" } else { "?" },
            self.param
        )
    }
}

/// Extracts a value from an `a=b&c=d` query string.
pub fn query_value(param: &str, key: &str) -> Option<String> {
    let trimmed = param.trim_start_matches('?');
    for pair in trimmed.split('&') {
        let mut it = pair.splitn(2, '=');
        if it.next() == Some(key) {
            return Some(it.next().unwrap_or("").to_string());
        }
    }
    None
}

/// Splits an RTMP app field possibly carrying a query (`app?vhost=x`).
pub fn split_app_param(app: &str) -> (String, String) {
    match app.split_once('?') {
        Some((a, p)) => (a.to_string(), p.to_string()),
        None => (app.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_is_vhost_app_stream() {
        let req = StreamRequest::new("rtmp", "example.com", "live", "livestream", 1935);
        assert_eq!(req.stream_url(), "example.com/live/livestream");
    }

    #[test]
    fn vhost_defaults_to_host() {
        let req = StreamRequest::new("rtmp", "203.0.113.7", "live", "x", 1935);
        assert_eq!(req.vhost, "203.0.113.7");
    }

    #[test]
    fn param_vhost_overrides_host() {
        let req = StreamRequest::new("rtmp", "203.0.113.7", "live", "x", 1935)
            .with_param("vhost=demo.example.com&token=abc");
        assert_eq!(req.vhost, "demo.example.com");
        assert_eq!(req.stream_url(), "demo.example.com/live/x");
        assert_eq!(query_value(&req.param, "token").as_deref(), Some("abc"));
    }

    #[test]
    fn clone_detaches_from_original() {
        let mut req = StreamRequest::new("rtmp", "h", "live", "a", 1935);
        let copy = req.clone();
        req.stream = "b".into();
        assert_eq!(copy.stream, "a");
    }

    #[test]
    fn split_app_param_handles_query() {
        let (app, param) = split_app_param("live?vhost=v");
        assert_eq!(app, "live");
        assert_eq!(param, "vhost=v");

        let (app, param) = split_app_param("live");
        assert_eq!(app, "live");
        assert!(param.is_empty());
    }
}
