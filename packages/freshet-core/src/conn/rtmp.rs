//! The RTMP server connection.
//!
//! One coroutine per accepted socket: handshake, connect, identify, then
//! either the publisher read loop or the player write loop. Publishing
//! acquires the process-wide token first; contention rejects the newcomer
//! and never disturbs the incumbent. EAGAIN never surfaces here (the
//! runtime parks the task); EOF is terminal; a write timeout aborts the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;

use crate::bridge::rtp_builder::{FrameToRtcBridge, RtpBuilderConfig};
use crate::bridge::{CompositeBridge, FrameTarget, StreamBridge};
use crate::conn::AdapterContext;
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::packet::{MediaPacket, PacketKind};
use crate::protocol::amf0::Amf0Value;
use crate::protocol::rtmp::{
    command_message, csid, msg_type, serve_handshake, set_chunk_size_message,
    set_peer_bandwidth_message, window_ack_size_message, ChunkDecoder, ChunkEncoder,
    RtmpMessage, OUT_CHUNK_SIZE,
};
use crate::kbps::Kbps;
use crate::request::{split_app_param, StreamRequest};
use crate::resource::{Resource, ResourceManager};
use crate::runtime::coroutine::{Coroutine, CoroutineHandler};

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Publisher state machine per the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshake,
    Connected,
    Publishing,
    Playing,
    Closing,
}

/// Accepts RTMP clients and spawns a connection coroutine for each.
pub struct RtmpListener {
    ctx: AdapterContext,
    port: u16,
    conns: Arc<ResourceManager>,
}

impl RtmpListener {
    pub fn new(ctx: AdapterContext, port: u16, conns: Arc<ResourceManager>) -> Self {
        Self { ctx, port, conns }
    }

    /// Binds and serves until the coroutine is stopped.
    pub async fn serve(&self, co: Arc<Coroutine>) -> ServerResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        log::info!("[Rtmp] listening on :{}", self.port);

        loop {
            co.pull()?;
            let (socket, peer) = co.drive(async { Ok(listener.accept().await?) }).await?;
            socket.set_nodelay(true).ok();

            let cid = ContextId::new();
            log::info!("[Rtmp] client {} accepted, cid={}", peer, cid);

            let conn = RtmpConnection::new(self.ctx.clone(), cid);
            self.conns
                .add_with_id(cid, Arc::clone(&conn) as Arc<dyn Resource>);

            let handler = Arc::new(SocketCycle {
                conn,
                socket: Mutex::new(Some(socket)),
                conns: Arc::clone(&self.conns),
            });
            let conn_co = Coroutine::new("rtmp", cid);
            conn_co.start(self.ctx.spawner.as_ref(), handler);
        }
    }
}

struct SocketCycle {
    conn: Arc<RtmpConnection>,
    socket: Mutex<Option<TcpStream>>,
    conns: Arc<ResourceManager>,
}

#[async_trait]
impl CoroutineHandler for SocketCycle {
    async fn cycle(&self) -> ServerResult<()> {
        let Some(mut socket) = self.socket.lock().take() else {
            return Ok(());
        };
        let result = self.conn.run(&mut socket).await;
        // Disposal is deferred: the manager drops us from its own cycle,
        // never from inside this coroutine.
        let resource = Arc::clone(&self.conn) as Arc<dyn Resource>;
        self.conns.remove(&resource);
        result
    }
}

/// One accepted RTMP client.
pub struct RtmpConnection {
    ctx: AdapterContext,
    cid: ContextId,
    state: Mutex<ConnState>,
}

impl Resource for RtmpConnection {
    fn cid(&self) -> ContextId {
        self.cid
    }

    fn desc(&self) -> String {
        format!("rtmp-conn/{:?}", *self.state.lock())
    }
}

impl RtmpConnection {
    pub fn new(ctx: AdapterContext, cid: ContextId) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            cid,
            state: Mutex::new(ConnState::Handshake),
        })
    }

    fn set_state(&self, next: ConnState) {
        *self.state.lock() = next;
    }

    /// Drives the whole connection; the socket is any byte stream, which
    /// is what the tests exploit.
    pub async fn run<S>(&self, io: &mut S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.do_run(io).await;
        self.set_state(ConnState::Closing);
        match &result {
            Err(err) if err.is_interrupted() => {
                log::debug!("[Rtmp] cid={} stopped", self.cid);
            }
            Err(err) => {
                log::warn!("[Rtmp] cid={} closed: {}", self.cid, err);
            }
            Ok(()) => {}
        }
        result
    }

    async fn do_run<S>(&self, io: &mut S) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        serve_handshake(io).await.map_err(|e| e.wrap("handshake"))?;

        let mut decoder = ChunkDecoder::new();
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::with_capacity(16 * 1024);

        // Expect connect, reply with the session preamble.
        let req = self.expect_connect(io, &mut decoder, &mut encoder, &mut buf).await?;
        self.set_state(ConnState::Connected);

        // Identify: createStream then publish or play.
        self.identify(io, &mut decoder, &mut encoder, &mut buf, req).await
    }

    async fn expect_connect<S>(
        &self,
        io: &mut S,
        decoder: &mut ChunkDecoder,
        encoder: &mut ChunkEncoder,
        buf: &mut BytesMut,
    ) -> ServerResult<StreamRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let msg = self.read_message(io, decoder, buf).await?;
            if !msg.is_amf0_command() {
                continue;
            }
            let values = Amf0Value::decode_all(&msg.payload)?;
            if values.front().and_then(|v| v.as_str()) != Some("connect") {
                continue;
            }
            let transaction = values.get(1).and_then(|v| v.as_number()).unwrap_or(1.0);
            let obj = values
                .get(2)
                .ok_or_else(|| ServerError::Protocol("connect without object".into()))?;
            let app_raw = obj
                .get("app")
                .and_then(|v| v.as_str())
                .unwrap_or(crate::request::DEFAULT_APP)
                .to_string();
            let tc_url = obj.get("tcUrl").and_then(|v| v.as_str()).unwrap_or("");
            let (host, port) = parse_tc_url_host(tc_url);
            let (app, param) = split_app_param(&app_raw);

            let req = StreamRequest::new("rtmp", host, app, "", port).with_param(param);

            // Session preamble.
            self.write(io, &encoder.encode(csid::PROTOCOL, &window_ack_size_message(2_500_000)))
                .await?;
            self.write(io, &encoder.encode(csid::PROTOCOL, &set_peer_bandwidth_message(2_500_000)))
                .await?;
            self.write(
                io,
                &encoder.encode(csid::PROTOCOL, &set_chunk_size_message(OUT_CHUNK_SIZE as u32)),
            )
            .await?;
            encoder.set_chunk_size(OUT_CHUNK_SIZE);

            let result = command_message(
                0,
                &[
                    Amf0Value::String("_result".into()),
                    Amf0Value::Number(transaction),
                    Amf0Value::Object(vec![
                        ("fmsVer".into(), Amf0Value::String("FMS/3,5,3,888".into())),
                        ("capabilities".into(), Amf0Value::Number(127.0)),
                    ]),
                    Amf0Value::Object(vec![
                        ("level".into(), Amf0Value::String("status".into())),
                        (
                            "code".into(),
                            Amf0Value::String("NetConnection.Connect.Success".into()),
                        ),
                        (
                            "description".into(),
                            Amf0Value::String("Connection succeeded".into()),
                        ),
                    ]),
                ],
            );
            self.write(io, &encoder.encode(csid::COMMAND, &result)).await?;
            return Ok(req);
        }
    }

    async fn identify<S>(
        &self,
        io: &mut S,
        decoder: &mut ChunkDecoder,
        encoder: &mut ChunkEncoder,
        buf: &mut BytesMut,
        mut req: StreamRequest,
    ) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let msg = self.read_message(io, decoder, buf).await?;
            if msg.message_type == msg_type::SET_CHUNK_SIZE {
                apply_chunk_size(decoder, &msg)?;
                continue;
            }
            if !msg.is_amf0_command() {
                continue;
            }
            let values = Amf0Value::decode_all(&msg.payload)?;
            let Some(command) = values.front().and_then(|v| v.as_str()) else {
                continue;
            };
            let transaction = values.get(1).and_then(|v| v.as_number()).unwrap_or(0.0);

            match command {
                "createStream" => {
                    let result = command_message(
                        0,
                        &[
                            Amf0Value::String("_result".into()),
                            Amf0Value::Number(transaction),
                            Amf0Value::Null,
                            Amf0Value::Number(1.0),
                        ],
                    );
                    self.write(io, &encoder.encode(csid::COMMAND, &result)).await?;
                }
                "publish" => {
                    let (stream, param) = split_stream_param(
                        values.get(3).and_then(|v| v.as_str()).unwrap_or(""),
                    );
                    req.stream = stream;
                    if !param.is_empty() {
                        req = req.with_param(param);
                    }
                    return self.publish(io, decoder, encoder, buf, &req).await;
                }
                "play" => {
                    let (stream, param) = split_stream_param(
                        values.get(3).and_then(|v| v.as_str()).unwrap_or(""),
                    );
                    req.stream = stream;
                    if !param.is_empty() {
                        req = req.with_param(param);
                    }
                    return self.play(io, decoder, encoder, buf, &req).await;
                }
                "releaseStream" | "FCPublish" | "FCUnpublish" | "getStreamLength" => {
                    // Harmless encoder chatter; acknowledge and move on.
                    if transaction != 0.0 {
                        let result = command_message(
                            0,
                            &[
                                Amf0Value::String("_result".into()),
                                Amf0Value::Number(transaction),
                                Amf0Value::Null,
                                Amf0Value::Undefined,
                            ],
                        );
                        self.write(io, &encoder.encode(csid::COMMAND, &result)).await?;
                    }
                }
                other => {
                    log::debug!("[Rtmp] cid={} ignoring command {}", self.cid, other);
                }
            }
        }
    }

    async fn publish<S>(
        &self,
        io: &mut S,
        decoder: &mut ChunkDecoder,
        encoder: &mut ChunkEncoder,
        buf: &mut BytesMut,
        req: &StreamRequest,
    ) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // The token is the single-writer gate across all protocols.
        let token = match self.ctx.tokens.acquire(req, self.cid) {
            Ok(token) => token,
            Err(err) => {
                let status = on_status_message("error", "NetStream.Publish.BadName", &err.to_string());
                self.write(io, &encoder.encode(csid::COMMAND, &status)).await?;
                return Err(err);
            }
        };

        let source = self.ctx.live.fetch_or_create(req);
        if self.ctx.rtmp_to_rtc {
            let rtc_source = self.ctx.rtc.fetch_or_create(req);
            let bridge = FrameToRtcBridge::new(
                rtc_source,
                self.cid,
                RtpBuilderConfig::default(),
                Arc::clone(&self.ctx.breaker),
            );
            let composite = CompositeBridge::new().append(bridge as Arc<dyn StreamBridge>);
            source.set_bridge(Arc::new(composite), req)?;
        }
        source.on_publish(req, self.cid)?;
        self.set_state(ConnState::Publishing);

        let status = on_status_message("status", "NetStream.Publish.Start", "Started publishing stream.");
        self.write(io, &encoder.encode(csid::COMMAND, &status)).await?;
        log::info!("[Rtmp] publish {} cid={}", req.desc(), self.cid);

        let mut print = self.ctx.prints.rtmp_publish();
        let kbps = Kbps::new(Arc::clone(&self.ctx.clock));
        let result = loop {
            let msg = match self.read_message(io, decoder, buf).await {
                Ok(msg) => msg,
                Err(err) => break Err(err),
            };

            kbps.add_bytes(msg.payload.len() as i64);
            print.elapse();
            if print.can_print() {
                kbps.sample();
                log::info!(
                    "[Rtmp] <- publish cid={} age={}s in={}kbps/10s {}kbps/30s",
                    self.cid,
                    print.age().as_secs(),
                    kbps.kbps_10s(),
                    kbps.kbps_30s()
                );
            }

            match msg.message_type {
                msg_type::SET_CHUNK_SIZE => {
                    if let Err(err) = apply_chunk_size(decoder, &msg) {
                        break Err(err);
                    }
                }
                msg_type::AUDIO | msg_type::VIDEO | msg_type::AMF0_DATA => {
                    if let Err(err) = self.on_media(&source, &msg) {
                        break Err(err);
                    }
                }
                msg_type::AGGREGATE => {
                    if let Err(err) = self.on_aggregate(&source, &msg) {
                        break Err(err);
                    }
                }
                msg_type::AMF0_COMMAND => match Amf0Value::decode_all(&msg.payload) {
                    Ok(values)
                        if values.front().and_then(|v| v.as_str()) == Some("FCUnpublish") =>
                    {
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => break Err(err),
                },
                _ => {}
            }
        };

        // Closing: the source signals consumers, the token frees the URL.
        source.on_unpublish();
        drop(token);
        self.set_state(ConnState::Closing);
        result
    }

    fn on_media(&self, source: &Arc<crate::hub::LiveSource>, msg: &RtmpMessage) -> ServerResult<()> {
        let kind = match msg.message_type {
            msg_type::AUDIO => PacketKind::Audio,
            msg_type::VIDEO => PacketKind::Video,
            _ => PacketKind::Metadata,
        };
        let pkt = MediaPacket::new(kind, msg.timestamp as i64, msg.payload.clone());
        source.on_frame(&pkt)
    }

    /// Demultiplexes an RTMP aggregate message into its tags.
    fn on_aggregate(
        &self,
        source: &Arc<crate::hub::LiveSource>,
        msg: &RtmpMessage,
    ) -> ServerResult<()> {
        let data = &msg.payload;
        let mut offset = 0usize;
        let mut base: Option<i64> = None;

        while offset + 11 <= data.len() {
            let tag = data[offset];
            let size = u32::from_be_bytes([0, data[offset + 1], data[offset + 2], data[offset + 3]])
                as usize;
            let ts = u32::from_be_bytes([
                data[offset + 7],
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
            ]) as i64;
            offset += 11;
            if offset + size + 4 > data.len() {
                return Err(ServerError::Protocol("aggregate tag overrun".into()));
            }

            // The first tag's timestamp anchors the aggregate; subsequent
            // tags keep their deltas relative to the message timestamp.
            let delta = *base.get_or_insert(ts);
            let timestamp = msg.timestamp as i64 + (ts - delta);

            let kind = match tag {
                t if t == msg_type::AUDIO => Some(PacketKind::Audio),
                t if t == msg_type::VIDEO => Some(PacketKind::Video),
                18 => Some(PacketKind::Metadata),
                _ => None,
            };
            if let Some(kind) = kind {
                let pkt = MediaPacket::new(kind, timestamp, data.slice(offset..offset + size));
                source.on_frame(&pkt)?;
            }
            offset += size + 4; // skip PreviousTagSize
        }
        Ok(())
    }

    async fn play<S>(
        &self,
        io: &mut S,
        decoder: &mut ChunkDecoder,
        encoder: &mut ChunkEncoder,
        buf: &mut BytesMut,
        req: &StreamRequest,
    ) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let source = self.ctx.live.fetch_or_create(req);
        let consumer = source.create_consumer(self.cid);
        self.set_state(ConnState::Playing);

        let status = on_status_message("status", "NetStream.Play.Start", "Started playing stream.");
        self.write(io, &encoder.encode(csid::COMMAND, &status)).await?;
        log::info!("[Rtmp] play {} cid={}", req.desc(), self.cid);

        let mut print = self.ctx.prints.rtmp_play();
        loop {
            // Let control messages through without blocking the send loop.
            if let Some(msg) = self.try_read_message(decoder, buf)? {
                if msg.message_type == msg_type::SET_CHUNK_SIZE {
                    apply_chunk_size(decoder, &msg)?;
                }
            }

            match self.dequeue_with_pull(&consumer).await {
                Ok(Some(pkt)) => {
                    print.elapse();
                    if print.can_print() {
                        log::info!(
                            "[Rtmp] -> play cid={} age={}s queue={}",
                            self.cid,
                            print.age().as_secs(),
                            consumer.len()
                        );
                    }
                    let msg = RtmpMessage {
                        message_type: match pkt.kind {
                            PacketKind::Audio => msg_type::AUDIO,
                            PacketKind::Video => msg_type::VIDEO,
                            _ => msg_type::AMF0_DATA,
                        },
                        timestamp: pkt.timestamp as u32,
                        stream_id: 1,
                        payload: pkt.payload.clone(),
                    };
                    self.write(io, &encoder.encode(csid::MEDIA, &msg)).await?;
                }
                Ok(None) => {
                    // End of stream: tell the player and leave.
                    let status =
                        on_status_message("status", "NetStream.Play.UnpublishNotify", "stream ended");
                    self.write(io, &encoder.encode(csid::COMMAND, &status)).await?;
                    self.set_state(ConnState::Closing);
                    return Ok(());
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    self.set_state(ConnState::Closing);
                    return Err(err);
                }
            }
        }
    }

    async fn dequeue_with_pull(
        &self,
        consumer: &Arc<crate::hub::LiveConsumer>,
    ) -> ServerResult<Option<Arc<MediaPacket>>> {
        consumer.dequeue(DEQUEUE_TIMEOUT).await
    }

    /// Reads bytes until the decoder yields one message.
    async fn read_message<S>(
        &self,
        io: &mut S,
        decoder: &mut ChunkDecoder,
        buf: &mut BytesMut,
    ) -> ServerResult<RtmpMessage>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if let Some(msg) = decoder.decode(buf)? {
                return Ok(msg);
            }
            let n = io.read_buf(buf).await?;
            if n == 0 {
                return Err(ServerError::Eof("rtmp read".into()));
            }
        }
    }

    /// Drains buffered bytes without blocking on the socket.
    fn try_read_message(
        &self,
        decoder: &mut ChunkDecoder,
        buf: &mut BytesMut,
    ) -> ServerResult<Option<RtmpMessage>> {
        decoder.decode(buf)
    }

    async fn write<S>(&self, io: &mut S, data: &Bytes) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tokio::time::timeout(WRITE_TIMEOUT, io.write_all(data))
            .await
            .map_err(|_| ServerError::Timeout("rtmp write".into()))??;
        Ok(())
    }
}

fn apply_chunk_size(decoder: &mut ChunkDecoder, msg: &RtmpMessage) -> ServerResult<()> {
    if msg.payload.len() < 4 {
        return Err(ServerError::Protocol("set chunk size too short".into()));
    }
    let size = u32::from_be_bytes([
        msg.payload[0],
        msg.payload[1],
        msg.payload[2],
        msg.payload[3],
    ]) as usize;
    decoder.set_chunk_size(size);
    Ok(())
}

fn on_status_message(level: &str, code: &str, description: &str) -> RtmpMessage {
    command_message(
        1,
        &[
            Amf0Value::String("onStatus".into()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(vec![
                ("level".into(), Amf0Value::String(level.into())),
                ("code".into(), Amf0Value::String(code.into())),
                ("description".into(), Amf0Value::String(description.into())),
            ]),
        ],
    )
}

/// Splits `stream?a=b` into name and params.
fn split_stream_param(stream: &str) -> (String, String) {
    match stream.split_once('?') {
        Some((s, p)) => (s.to_string(), p.to_string()),
        None => (stream.to_string(), String::new()),
    }
}

/// Extracts host and port from a tcUrl like `rtmp://host:port/app`.
fn parse_tc_url_host(tc_url: &str) -> (String, u16) {
    let rest = tc_url
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(tc_url);
    let authority = rest.split('/').next().unwrap_or("");
    match authority.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1935)),
        None => (authority.to_string(), 1935),
    }
}
