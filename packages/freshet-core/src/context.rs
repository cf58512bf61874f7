//! Context identifiers and network configuration shared across services.
//!
//! [`ContextId`] is the short random id threaded through every connection
//! coroutine and log line. [`NetworkContext`] bundles the bind port and the
//! advertised IP used for coworker redirects and heartbeats; it supports both
//! explicit configuration and auto-detection.

use std::fmt;
use std::net::IpAddr;
#[cfg(test)]
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;

const CONTEXT_ID_LEN: usize = 8;
const CONTEXT_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Short random identifier for one connection or coroutine.
///
/// Eight lowercase alphanumeric characters, compared by value and cheap to
/// copy. Every log line of a connection carries its id so interleaved lines
/// from thousands of clients remain attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    bytes: [u8; CONTEXT_ID_LEN],
    len: u8,
}

impl ContextId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; CONTEXT_ID_LEN];
        for b in bytes.iter_mut() {
            *b = CONTEXT_ID_CHARSET[rng.random_range(0..CONTEXT_ID_CHARSET.len())];
        }
        Self {
            bytes,
            len: CONTEXT_ID_LEN as u8,
        }
    }

    /// The empty id, used before a connection is assigned one.
    pub const fn empty() -> Self {
        Self {
            bytes: [0u8; CONTEXT_ID_LEN],
            len: 0,
        }
    }

    /// Builds an id from a fixed string, truncated to eight characters.
    ///
    /// Intended for tests and for ids received from a peer.
    pub fn from_str(s: &str) -> Self {
        let mut bytes = [0u8; CONTEXT_ID_LEN];
        let src = s.as_bytes();
        let len = src.len().min(CONTEXT_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Whether the id has been assigned.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        // Charset is ASCII, so the slice is always valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContextId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Network configuration shared across services.
///
/// Bundles the server port and advertised IP that coworker redirects and
/// heartbeats need for constructing reachable endpoints.
///
/// # Modes
///
/// - **Explicit**: server deployment where bind address and advertise IP are
///   specified in configuration. Use [`NetworkContext::explicit`].
/// - **Auto-detect**: the local IP is discovered from the host's interfaces.
///   Use [`NetworkContext::auto_detect`].
#[derive(Clone)]
pub struct NetworkContext {
    /// RTMP listen port (initially 0 if auto-assigned, set when bound).
    pub port: Arc<RwLock<u16>>,
    /// Notifier signaled when the port is assigned.
    pub port_notify: Arc<Notify>,
    /// IP address that clients can reach us at.
    pub local_ip: Arc<RwLock<String>>,
    /// IP detector for re-checking network changes (auto-detect mode only).
    ip_detector: Option<Arc<dyn IpDetector>>,
}

impl NetworkContext {
    /// Creates a `NetworkContext` with explicit configuration.
    #[must_use]
    pub fn explicit(bind_port: u16, advertise_ip: IpAddr) -> Self {
        Self {
            port: Arc::new(RwLock::new(bind_port)),
            port_notify: Arc::new(Notify::new()),
            local_ip: Arc::new(RwLock::new(advertise_ip.to_string())),
            ip_detector: None,
        }
    }

    /// Creates a `NetworkContext` that detects the local IP automatically.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial IP detection fails.
    pub fn auto_detect(
        preferred_port: u16,
        ip_detector: Arc<dyn IpDetector>,
    ) -> Result<Self, NetworkError> {
        let local_ip = ip_detector.detect()?;
        Ok(Self {
            port: Arc::new(RwLock::new(preferred_port)),
            port_notify: Arc::new(Notify::new()),
            local_ip: Arc::new(RwLock::new(local_ip)),
            ip_detector: Some(ip_detector),
        })
    }

    /// Creates a `NetworkContext` for testing with a fixed IP.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::explicit(0, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
    }

    /// Detects the current local IP address using the configured detector.
    pub fn detect_ip(&self) -> Result<String, NetworkError> {
        match &self.ip_detector {
            Some(detector) => detector.detect(),
            None => Err(NetworkError::NoDetector),
        }
    }

    /// Returns the current port value.
    #[must_use]
    pub fn get_port(&self) -> u16 {
        *self.port.read()
    }

    /// Returns the current local IP.
    #[must_use]
    pub fn get_local_ip(&self) -> String {
        self.local_ip.read().clone()
    }

    /// Sets the port and notifies waiters.
    pub fn set_port(&self, port: u16) {
        *self.port.write() = port;
        self.port_notify.notify_waiters();
    }

    /// Updates the local IP address.
    pub fn set_local_ip(&self, ip: String) {
        *self.local_ip.write() = ip;
    }
}

/// Trait for detecting the local IP address.
///
/// Different environments may need different detection strategies.
/// This trait allows injecting the appropriate detector.
pub trait IpDetector: Send + Sync {
    /// Detects the local IP address.
    fn detect(&self) -> Result<String, NetworkError>;
}

/// Default IP detector using the system's network interfaces.
#[derive(Debug, Clone, Default)]
pub struct LocalIpDetector;

impl LocalIpDetector {
    /// Creates a new `LocalIpDetector`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a new `LocalIpDetector` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> Arc<dyn IpDetector> {
        Arc::new(Self::new())
    }
}

impl IpDetector for LocalIpDetector {
    fn detect(&self) -> Result<String, NetworkError> {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .map_err(|e| NetworkError::Detection(e.to_string()))
    }
}

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not detect local IP address.
    #[error("Failed to detect local IP: {0}")]
    Detection(String),

    /// No IP detector configured (explicit mode).
    #[error("No IP detector configured (using explicit mode)")]
    NoDetector,
}
