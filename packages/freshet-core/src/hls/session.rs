//! Virtual connections for HLS players.
//!
//! HLS has no persistent socket, so each player is tracked as a session
//! keyed by the `hls_ctx` query context. Playlist requests create or
//! refresh the session; segment requests must present a live one. A timer
//! sweep expires sessions idle past the timeout and fires the stop hooks,
//! which is where play statistics and consumer teardown happen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::request::StreamRequest;
use crate::runtime::timer::FastTimerHandler;

/// One HLS player session.
pub struct HlsSession {
    ctx: String,
    cid: ContextId,
    req: StreamRequest,
    last_request: Mutex<Instant>,
}

impl HlsSession {
    /// The query-string context identifying the session.
    pub fn ctx(&self) -> &str {
        &self.ctx
    }

    pub fn cid(&self) -> ContextId {
        self.cid
    }

    pub fn request(&self) -> &StreamRequest {
        &self.req
    }

    fn touch(&self, now: Instant) {
        *self.last_request.lock() = now;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_request.lock())
    }
}

/// Observer of session expiry.
pub trait SessionStopHandler: Send + Sync {
    fn on_stop(&self, session: &Arc<HlsSession>);
}

/// Registry of live HLS sessions with idle expiry.
pub struct HlsSessionStore {
    sessions: DashMap<String, Arc<HlsSession>>,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
    stop_handlers: Mutex<Vec<Arc<dyn SessionStopHandler>>>,
}

impl HlsSessionStore {
    /// Creates a store; subscribe it to a fast timer to enable expiry.
    pub fn new(idle_timeout: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            idle_timeout,
            clock,
            stop_handlers: Mutex::new(Vec::new()),
        })
    }

    /// Registers a stop hook.
    pub fn on_stop(&self, handler: Arc<dyn SessionStopHandler>) {
        self.stop_handlers.lock().push(handler);
    }

    /// Creates the session for a playlist request, or refreshes its idle
    /// clock if it already exists.
    pub fn create_or_refresh(&self, ctx: &str, req: &StreamRequest) -> Arc<HlsSession> {
        let now = self.clock.now();
        if let Some(session) = self.sessions.get(ctx) {
            session.touch(now);
            return Arc::clone(session.value());
        }

        let session = Arc::new(HlsSession {
            ctx: ctx.to_string(),
            cid: ContextId::new(),
            req: req.clone(),
            last_request: Mutex::new(now),
        });
        log::info!(
            "[HlsSession] start ctx={} cid={} url={}",
            ctx,
            session.cid,
            req.stream_url()
        );
        self.sessions.insert(ctx.to_string(), Arc::clone(&session));
        session
    }

    /// Validates a segment request against its session and refreshes it.
    pub fn validate(&self, ctx: &str) -> ServerResult<Arc<HlsSession>> {
        match self.sessions.get(ctx) {
            Some(session) => {
                session.touch(self.clock.now());
                Ok(Arc::clone(session.value()))
            }
            None => Err(ServerError::SessionNotFound(format!("hls ctx={}", ctx))),
        }
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn sweep(&self) {
        let now = self.clock.now();
        let expired: Vec<Arc<HlsSession>> = self
            .sessions
            .iter()
            .filter(|r| r.value().idle_for(now) >= self.idle_timeout)
            .map(|r| Arc::clone(r.value()))
            .collect();

        if expired.is_empty() {
            return;
        }
        let handlers = self.stop_handlers.lock().clone();
        for session in expired {
            self.sessions.remove(session.ctx());
            log::info!(
                "[HlsSession] expire ctx={} cid={} after {}s idle",
                session.ctx(),
                session.cid(),
                self.idle_timeout.as_secs()
            );
            for handler in &handlers {
                handler.on_stop(&session);
            }
        }
    }
}

#[async_trait]
impl FastTimerHandler for HlsSessionStore {
    async fn on_timer(&self, _interval: Duration) -> ServerResult<()> {
        self.sweep();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    fn req() -> StreamRequest {
        StreamRequest::new("hls", "example.com", "live", "livestream", 8080)
    }

    struct StopProbe {
        stopped: Mutex<Vec<String>>,
    }

    impl SessionStopHandler for StopProbe {
        fn on_stop(&self, session: &Arc<HlsSession>) {
            self.stopped.lock().push(session.ctx().to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn playlist_creates_and_segment_validates() {
        let store = HlsSessionStore::new(Duration::from_secs(30), TokioClock::arc());
        let session = store.create_or_refresh("ctx1", &req());
        assert_eq!(store.len(), 1);

        let validated = store.validate("ctx1").unwrap();
        assert_eq!(validated.cid(), session.cid());
        assert!(store.validate("unknown").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_the_same_session() {
        let store = HlsSessionStore::new(Duration::from_secs(30), TokioClock::arc());
        let a = store.create_or_refresh("ctx1", &req());
        let b = store.create_or_refresh("ctx1", &req());
        assert_eq!(a.cid(), b.cid());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire_and_fire_stop_hooks() {
        let store = HlsSessionStore::new(Duration::from_secs(30), TokioClock::arc());
        let probe = Arc::new(StopProbe {
            stopped: Mutex::new(Vec::new()),
        });
        store.on_stop(probe.clone());

        store.create_or_refresh("old", &req());
        tokio::time::sleep(Duration::from_secs(20)).await;
        store.create_or_refresh("fresh", &req());

        tokio::time::sleep(Duration::from_secs(10)).await;
        store.on_timer(Duration::from_secs(5)).await.unwrap();

        // Only the idle session expired; the refreshed one survives.
        assert_eq!(*probe.stopped.lock(), vec!["old".to_string()]);
        assert_eq!(store.len(), 1);
        assert!(store.validate("fresh").is_ok());
        assert!(store.validate("old").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn segment_request_refreshes_idle_clock() {
        let store = HlsSessionStore::new(Duration::from_secs(30), TokioClock::arc());
        store.create_or_refresh("ctx1", &req());

        tokio::time::sleep(Duration::from_secs(25)).await;
        store.validate("ctx1").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        store.on_timer(Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
