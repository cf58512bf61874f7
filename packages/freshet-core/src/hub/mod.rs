//! The stream source hub.
//!
//! For each logical stream URL there is one source per protocol domain: a
//! live (frame) source for RTMP/FLV/HLS, an RTC (RTP) source, and an SRT
//! (TS) source. A single publisher feeds the source; the source fans out to
//! every consumer of its domain and, through bridges, to the sources of the
//! other domains.

pub mod live;
pub mod rtc;
pub mod srt;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::request::StreamRequest;

pub use live::{ConsumerBounds, LiveConsumer, LiveSource, LiveSourceRegistry};
pub use rtc::{KeyframeRequester, RtcConsumer, RtcSource, RtcSourceRegistry};
pub use srt::{SrtSource, SrtSourceRegistry};

/// Observer of publish/unpublish transitions of any source.
///
/// Coworkers, the heartbeat summary and the HLS controller subscribe here.
pub trait SourceEventHandler: Send + Sync {
    fn on_publish(&self, req: &StreamRequest);
    fn on_unpublish(&self, req: &StreamRequest);
}

/// Shared fan-out list for source lifecycle events.
#[derive(Default)]
pub struct SourceEvents {
    handlers: Mutex<Vec<Arc<dyn SourceEventHandler>>>,
}

impl SourceEvents {
    /// Creates an empty event hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes a handler.
    pub fn subscribe(&self, handler: Arc<dyn SourceEventHandler>) {
        self.handlers.lock().push(handler);
    }

    /// Notifies all handlers of a publish.
    pub fn notify_publish(&self, req: &StreamRequest) {
        tracing::debug!(url = %req.stream_url(), schema = %req.schema, "publish_event");
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler.on_publish(req);
        }
    }

    /// Notifies all handlers of an unpublish.
    pub fn notify_unpublish(&self, req: &StreamRequest) {
        tracing::debug!(url = %req.stream_url(), schema = %req.schema, "unpublish_event");
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler.on_unpublish(req);
        }
    }
}
