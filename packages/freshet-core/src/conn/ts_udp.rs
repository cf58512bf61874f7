//! MPEG-TS ingest over UDP datagrams.
//!
//! The transport carries 188-byte TS packets (over raw UDP or an SRT tunnel
//! terminated in front of us; the SRT library itself is an external
//! collaborator). The first datagram of an idle stream acts as the publish
//! edge: the caster acquires the publish token, wires the demux bridge into
//! the frame domains and feeds the TS source until the peer goes quiet.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::bridge::rtp_builder::{FrameToLiveBridge, FrameToRtcBridge, RtpBuilderConfig};
use crate::bridge::ts_builder::SrtToFrameBridge;
use crate::bridge::{CompositeBridge, SrtTarget, StreamBridge};
use crate::clock::Clock;
use crate::conn::AdapterContext;
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hub::SrtSource;
use crate::pithy::ErrorPithyPrint;
use crate::protocol::mpegts::TS_PACKET_SIZE;
use crate::request::StreamRequest;
use crate::runtime::coroutine::Coroutine;
use crate::token::PublishToken;

/// How long without datagrams before the publisher is considered gone.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct IngestSession {
    token: PublishToken,
    source: Arc<SrtSource>,
    last_packet: Instant,
}

/// The datagram-independent ingest pipeline.
///
/// Buffers partial TS packets across datagrams, publishes on first data
/// and unpublishes after the idle timeout.
pub struct TsIngest {
    ctx: AdapterContext,
    req: StreamRequest,
    cid: ContextId,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<IngestSession>>,
    pending: Mutex<BytesMut>,
    errs: ErrorPithyPrint,
}

impl TsIngest {
    /// Creates the pipeline for the configured output stream.
    pub fn new(ctx: AdapterContext, req: StreamRequest, clock: Arc<dyn Clock>) -> Self {
        let errs = ErrorPithyPrint::new(Duration::from_secs(1), Arc::clone(&clock));
        Self {
            ctx,
            req,
            cid: ContextId::new(),
            clock,
            session: Mutex::new(None),
            pending: Mutex::new(BytesMut::new()),
            errs,
        }
    }

    /// Whether a publisher session is currently active.
    pub fn is_publishing(&self) -> bool {
        self.session.lock().is_some()
    }

    fn begin_session(&self) -> ServerResult<()> {
        let mut guard = self.session.lock();
        if guard.is_some() {
            return Ok(());
        }

        let token = self.ctx.tokens.acquire(&self.req, self.cid)?;

        let source = self.ctx.srt.fetch_or_create(&self.req);
        let live = self.ctx.live.fetch_or_create(&self.req);
        let mut composite =
            CompositeBridge::new().append(FrameToLiveBridge::new(live, self.cid) as Arc<dyn StreamBridge>);
        if self.ctx.rtmp_to_rtc {
            let rtc = self.ctx.rtc.fetch_or_create(&self.req);
            composite = composite.append(FrameToRtcBridge::new(
                rtc,
                self.cid,
                RtpBuilderConfig::default(),
                Arc::clone(&self.ctx.breaker),
            ) as Arc<dyn StreamBridge>);
        }
        source.set_bridge(SrtToFrameBridge::new(Arc::new(composite)), &self.req)?;
        source.on_publish(&self.req, self.cid)?;

        log::info!("[TsUdp] publish {} cid={}", self.req.desc(), self.cid);
        *guard = Some(IngestSession {
            token,
            source,
            last_packet: self.clock.now(),
        });
        Ok(())
    }

    /// Feeds one datagram.
    pub fn on_data(&self, data: &[u8]) -> ServerResult<()> {
        self.begin_session()?;

        // Align to whole TS packets across datagram boundaries.
        let aligned: Option<Bytes> = {
            let mut pending = self.pending.lock();
            pending.extend_from_slice(data);
            let whole = pending.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
            if whole == 0 {
                None
            } else {
                Some(pending.split_to(whole).freeze())
            }
        };

        let Some(chunk) = aligned else {
            return Ok(());
        };

        let source = {
            let mut guard = self.session.lock();
            let Some(session) = guard.as_mut() else {
                return Ok(());
            };
            session.last_packet = self.clock.now();
            Arc::clone(&session.source)
        };

        if let Err(err) = source.on_packet(&chunk) {
            if self.errs.can_print("ts_ingest") {
                log::warn!("[TsUdp] ingest error cid={}: {}", self.cid, err);
            }
        }
        Ok(())
    }

    /// Unpublishes if the peer has been quiet past the timeout.
    pub fn sweep_idle(&self) {
        let expired = {
            let guard = self.session.lock();
            match guard.as_ref() {
                Some(session) => {
                    self.clock.now().duration_since(session.last_packet) >= IDLE_TIMEOUT
                }
                None => false,
            }
        };
        if expired {
            self.stop();
        }
    }

    /// Ends the publish session, releasing the token.
    pub fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            log::info!("[TsUdp] unpublish {} cid={}", self.req.desc(), self.cid);
            session.source.on_unpublish();
            drop(session.token);
        }
        self.pending.lock().clear();
    }
}

/// UDP listener feeding a [`TsIngest`].
pub struct TsUdpCaster {
    ingest: Arc<TsIngest>,
    port: u16,
}

impl TsUdpCaster {
    pub fn new(ctx: AdapterContext, req: StreamRequest, clock: Arc<dyn Clock>, port: u16) -> Self {
        Self {
            ingest: Arc::new(TsIngest::new(ctx, req, clock)),
            port,
        }
    }

    /// The ingest pipeline (wiring and tests).
    pub fn ingest(&self) -> &Arc<TsIngest> {
        &self.ingest
    }

    /// Binds and serves until the coroutine is stopped.
    pub async fn serve(&self, co: Arc<Coroutine>) -> ServerResult<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port)).await?;
        log::info!("[TsUdp] listening on :{}", self.port);

        let mut buf = vec![0u8; 65536];
        loop {
            co.pull()?;

            let received = co
                .drive(async {
                    match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
                        .await
                    {
                        Ok(Ok((n, _peer))) => Ok(Some(n)),
                        Ok(Err(err)) => Err(ServerError::Io(err)),
                        Err(_) => Ok(None),
                    }
                })
                .await;

            match received {
                Ok(Some(n)) => {
                    if let Err(err) = self.ingest.on_data(&buf[..n]) {
                        log::warn!("[TsUdp] drop datagram: {}", err);
                    }
                }
                Ok(None) => self.ingest.sweep_idle(),
                Err(err) if err.is_interrupted() => {
                    self.ingest.stop();
                    return Err(err);
                }
                Err(err) => {
                    self.ingest.stop();
                    return Err(err);
                }
            }
        }
    }
}
