//! Process-wide single-writer lease per stream URL.
//!
//! Every publisher, whatever its protocol, must acquire the publish token
//! for its stream URL before touching the source. At most one acquired
//! token exists per URL; a second claimant is rejected with a stream-busy
//! error naming both context ids. The token is an RAII guard: dropping it
//! releases the lease, so no teardown path can leak one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::request::StreamRequest;

#[derive(Debug)]
struct TokenEntry {
    publisher_cid: ContextId,
}

/// The process-wide token map.
pub struct PublishTokenManager {
    tokens: Arc<Mutex<HashMap<String, TokenEntry>>>,
}

impl PublishTokenManager {
    /// Creates an empty manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Acquires the exclusive publish lease for the request's stream URL.
    ///
    /// Fails with [`ServerError::StreamBusy`] when another publisher holds
    /// it; the incumbent is untouched.
    pub fn acquire(&self, req: &StreamRequest, cid: ContextId) -> ServerResult<PublishToken> {
        let url = req.stream_url();
        let mut tokens = self.tokens.lock();

        if let Some(entry) = tokens.get(&url) {
            return Err(ServerError::StreamBusy {
                url,
                owner: entry.publisher_cid,
                current: cid,
            });
        }

        tokens.insert(url.clone(), TokenEntry { publisher_cid: cid });
        log::debug!("[Token] acquired url={} cid={}", url, cid);

        Ok(PublishToken {
            url,
            cid,
            tokens: Arc::clone(&self.tokens),
        })
    }

    /// The context id currently holding the URL, if any.
    pub fn owner(&self, url: &str) -> Option<ContextId> {
        self.tokens.lock().get(url).map(|e| e.publisher_cid)
    }

    /// Number of acquired tokens.
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether no token is held.
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

/// An acquired publish lease; releases itself on drop.
#[derive(Debug)]
pub struct PublishToken {
    url: String,
    cid: ContextId,
    tokens: Arc<Mutex<HashMap<String, TokenEntry>>>,
}

impl PublishToken {
    /// The stream URL this lease covers.
    pub fn stream_url(&self) -> &str {
        &self.url
    }

    /// The publisher's context id.
    pub fn publisher_cid(&self) -> ContextId {
        self.cid
    }
}

impl Drop for PublishToken {
    fn drop(&mut self) {
        let mut tokens = self.tokens.lock();
        // The entry is removed on release; the URL is reacquirable after.
        if tokens.remove(&self.url).is_some() {
            log::debug!("[Token] released url={} cid={}", self.url, self.cid);
        }
    }
}
