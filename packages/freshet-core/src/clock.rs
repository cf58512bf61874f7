//! Wall-clock abstraction for timer-driven components.
//!
//! Rate samplers, pithy print and the fragment window all reason about
//! elapsed time; injecting a [`Clock`] keeps them testable without real
//! sleeps. The production implementation delegates to tokio time, so tests
//! running under `tokio::time::pause` see virtual time consistently.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Time source for components that sleep or measure elapsed time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current unix time in milliseconds.
    fn unix_now_ms(&self) -> i64;

    /// Suspends the calling task for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by tokio time.
///
/// Under `#[tokio::test(start_paused = true)]` this advances with the
/// virtual clock, which is what timer tests rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl TokioClock {
    /// Creates a new `TokioClock`.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a new `TokioClock` wrapped in an Arc.
    #[must_use]
    pub fn arc() -> std::sync::Arc<dyn Clock> {
        std::sync::Arc::new(Self)
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now_ms(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
