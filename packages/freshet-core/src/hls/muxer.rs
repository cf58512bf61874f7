//! The HLS muxer: live frames in, rotating TS segments and a playlist out.
//!
//! One muxer per published stream. Video arrives as FLV-tagged AVCC and is
//! rewritten to Annex-B with SPS/PPS ahead of keyframes; audio is
//! ADTS-framed from the cached AudioSpecificConfig. Segments cut on
//! keyframes once the fragment target is reached; `reap_segment` closes
//! the current segment, opens the next and rewrites the playlist while
//! holding the muxer lock, so the timer-driven cleanup never observes the
//! window between the two halves.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bridge::FrameTarget;
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::hls::fragment::{Fragment, FragmentWindow};
use crate::hub::live::LiveSourceRegistry;
use crate::hub::SourceEventHandler;
use crate::packet::MediaPacket;
use crate::protocol::mpegts::{adts_frame, parse_audio_specific_config, PesKind, TsMuxer};
use crate::request::StreamRequest;
use crate::rtp::h264::{avcc_split, parse_decoder_configuration};
use crate::runtime::async_call::{AsyncCallTask, AsyncCallWorker};
use crate::runtime::coroutine::{Coroutine, CoroutineHandler, TaskSpawner};

/// HLS tuning from configuration.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub enabled: bool,
    /// Target duration of one segment.
    pub fragment_ms: i64,
    /// Total duration kept in the playlist.
    pub window_ms: i64,
    /// Root directory segments are written under.
    pub path: PathBuf,
    /// Segment file template; `[seq]` and `[duration]` are substituted.
    pub ts_template: String,
    /// Whether unpublish deletes the stream's files.
    pub cleanup: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fragment_ms: 6000,
            window_ms: 30_000,
            path: PathBuf::from("./objs/nginx/html"),
            ts_template: "[stream]-[seq]-[duration].ts".into(),
            cleanup: true,
        }
    }
}

struct CurrentSegment {
    fragment: Fragment,
    file: std::fs::File,
    ts: TsMuxer,
}

#[derive(Default)]
struct MuxState {
    window: FragmentWindow,
    current: Option<CurrentSegment>,
    sequence_no: u64,
    /// SPS/PPS Annex-B bytes prepended to keyframes.
    video_config: Option<(bytes::Bytes, bytes::Bytes)>,
    audio_config: Option<(u8, u8, u8)>,
    video_seen: bool,
}

/// Segment writer for one stream.
pub struct HlsMuxer {
    req: StreamRequest,
    config: HlsConfig,
    state: Mutex<MuxState>,
}

impl HlsMuxer {
    /// Creates a muxer for the stream.
    pub fn new(req: StreamRequest, config: HlsConfig) -> Arc<Self> {
        Arc::new(Self {
            req,
            config,
            state: Mutex::new(MuxState::default()),
        })
    }

    fn stream_dir(&self) -> PathBuf {
        self.config.path.join(&self.req.app)
    }

    fn playlist_path(&self) -> PathBuf {
        self.stream_dir().join(format!("{}.m3u8", self.req.stream))
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        let name = self
            .config
            .ts_template
            .replace("[stream]", &self.req.stream)
            .replace("[seq]", &seq.to_string());
        self.stream_dir().join(name)
    }

    /// Opens the next segment.
    fn open_segment(&self, state: &mut MuxState) -> ServerResult<()> {
        let seq = state.sequence_no;
        state.sequence_no += 1;

        let mut fragment = Fragment::new();
        fragment.set_number(seq);
        fragment.set_path(self.segment_path(seq));
        fragment.create_dir()?;

        let file = std::fs::File::create(fragment.tmppath())
            .map_err(|e| ServerError::Io(e).wrap("open segment"))?;

        let mut segment = CurrentSegment {
            fragment,
            file,
            ts: TsMuxer::new(),
        };
        // Every segment is self-describing: PAT and PMT lead.
        segment
            .file
            .write_all(&segment.ts.pat())
            .and_then(|_| segment.file.write_all(&segment.ts.pmt()))
            .map_err(|e| ServerError::Io(e).wrap("write psi"))?;

        state.current = Some(segment);
        Ok(())
    }

    /// Closes the current segment, rotates the window and rewrites the
    /// playlist. Atomic against the sweeper: callers hold the state lock.
    fn reap_segment(&self, state: &mut MuxState) -> ServerResult<()> {
        let Some(mut segment) = state.current.take() else {
            return Ok(());
        };
        segment
            .file
            .flush()
            .map_err(|e| ServerError::Io(e).wrap("flush segment"))?;
        drop(segment.file);

        segment.fragment.rename()?;
        state.window.append(segment.fragment);

        state.window.shrink(self.config.window_ms);
        state.window.clear_expired(self.config.cleanup);

        self.write_playlist(state)
    }

    fn write_playlist(&self, state: &MuxState) -> ServerResult<()> {
        if state.window.is_empty() {
            return Ok(());
        }

        let target = ((state.window.max_duration_ms() + 999) / 1000).max(1);
        let first_seq = state.window.first().map(Fragment::number).unwrap_or(0);

        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        m3u8.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", first_seq));
        m3u8.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
        for fragment in state.window.iter() {
            m3u8.push_str(&format!(
                "#EXTINF:{:.3},\n",
                fragment.duration_ms() as f64 / 1000.0
            ));
            let name = fragment
                .fullpath()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            m3u8.push_str(&name);
            m3u8.push('\n');
        }

        let path = self.playlist_path();
        let tmp = path.with_extension("m3u8.tmp");
        std::fs::write(&tmp, m3u8).map_err(|e| ServerError::Io(e).wrap("write playlist"))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| ServerError::Io(e).wrap("commit playlist"))?;
        Ok(())
    }

    fn on_video(&self, pkt: &MediaPacket) -> ServerResult<()> {
        if pkt.is_video_sequence_header() {
            let config = pkt.payload.slice(5..);
            let (sps, pps) = parse_decoder_configuration(&config)?;
            self.state.lock().video_config = Some((sps, pps));
            return Ok(());
        }
        if pkt.payload.len() < 5 {
            return Err(ServerError::Protocol("video payload too short".into()));
        }

        let keyframe = pkt.is_keyframe();
        let mut state = self.state.lock();
        state.video_seen = true;

        // Cut on keyframes once the fragment target is reached.
        let should_reap = keyframe
            && state
                .current
                .as_ref()
                .map(|s| s.fragment.duration_ms() >= self.config.fragment_ms)
                .unwrap_or(false);
        if should_reap {
            self.reap_segment(&mut state)?;
        }
        if state.current.is_none() {
            if !keyframe {
                // A segment must start decodable; wait for the keyframe.
                return Ok(());
            }
            self.open_segment(&mut state)?;
        }

        // AVCC to Annex-B, parameter sets ahead of keyframes.
        let mut es: Vec<u8> = Vec::with_capacity(pkt.payload.len() + 64);
        if keyframe {
            if let Some((sps, pps)) = state.video_config.clone() {
                es.extend_from_slice(&[0, 0, 0, 1]);
                es.extend_from_slice(&sps);
                es.extend_from_slice(&[0, 0, 0, 1]);
                es.extend_from_slice(&pps);
            }
        }
        let cts = i32::from_be_bytes([0, pkt.payload[2], pkt.payload[3], pkt.payload[4]]);
        let avcc = pkt.payload.slice(5..);
        for nalu in avcc_split(&avcc, 4)? {
            es.extend_from_slice(&[0, 0, 0, 1]);
            es.extend_from_slice(&nalu);
        }

        let dts = pkt.timestamp;
        let pts = dts + cts as i64;
        let Some(segment) = state.current.as_mut() else {
            return Ok(());
        };
        let packets = segment.ts.write_pes(PesKind::Video, pts, dts, &es, keyframe);
        segment
            .file
            .write_all(&packets)
            .map_err(|e| ServerError::Io(e).wrap("write video pes"))?;
        segment.fragment.append(dts);
        Ok(())
    }

    fn on_audio(&self, pkt: &MediaPacket) -> ServerResult<()> {
        if pkt.is_audio_sequence_header() {
            let asc = pkt.payload.slice(2..);
            let config = parse_audio_specific_config(&asc)?;
            self.state.lock().audio_config = Some(config);
            return Ok(());
        }
        if pkt.payload.len() < 3 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let Some((aot, freq, channels)) = state.audio_config else {
            // No config yet; cannot frame ADTS.
            return Ok(());
        };

        if state.current.is_none() {
            if state.video_seen {
                // Video-led stream: the keyframe opens the segment.
                return Ok(());
            }
            self.open_segment(&mut state)?;
        }

        let adts = adts_frame(aot, freq, channels, &pkt.payload[2..]);
        let pts = pkt.timestamp;
        let Some(segment) = state.current.as_mut() else {
            return Ok(());
        };
        let packets = segment.ts.write_pes(PesKind::Audio, pts, pts, &adts, false);
        segment
            .file
            .write_all(&packets)
            .map_err(|e| ServerError::Io(e).wrap("write audio pes"))?;
        segment.fragment.append(pts);
        Ok(())
    }

    /// Finishes the stream: commits the tail segment.
    pub fn on_unpublish(&self) {
        let mut state = self.state.lock();
        if let Err(err) = self.reap_segment(&mut state) {
            log::warn!("[Hls] reap at unpublish: {}", err);
        }
        if self.config.cleanup {
            state.window.dispose();
            if let Err(err) = std::fs::remove_file(self.playlist_path()) {
                log::debug!("[Hls] playlist remove: {}", err);
            }
        }
    }

    /// Number of committed segments in the window (tests/diagnostics).
    pub fn segment_count(&self) -> usize {
        self.state.lock().window.size()
    }
}

impl FrameTarget for HlsMuxer {
    fn on_frame(&self, frame: &Arc<MediaPacket>) -> ServerResult<()> {
        let result = if frame.is_video() {
            self.on_video(frame)
        } else if frame.is_audio() {
            self.on_audio(frame)
        } else {
            Ok(())
        };

        match result {
            Err(err @ ServerError::Protocol(_)) => {
                log::warn!("[Hls] drop frame ts={}: {}", frame.timestamp, err);
                Ok(())
            }
            other => other,
        }
    }
}

struct HlsStream {
    muxer: Arc<HlsMuxer>,
    co: Arc<Coroutine>,
}

struct HlsStreamCycle {
    co: Arc<Coroutine>,
    muxer: Arc<HlsMuxer>,
    registry: Arc<LiveSourceRegistry>,
    url: String,
}

#[async_trait]
impl CoroutineHandler for HlsStreamCycle {
    async fn cycle(&self) -> ServerResult<()> {
        let Some(source) = self.registry.find(&self.url) else {
            return Ok(());
        };
        let consumer = source.create_consumer(self.co.cid());

        loop {
            self.co.pull()?;
            match self
                .co
                .drive(consumer.dequeue(Duration::from_millis(500)))
                .await
            {
                Ok(Some(frame)) => self.muxer.on_frame(&frame)?,
                Ok(None) => return Ok(()),
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(err.wrap("hls consume")),
            }
        }
    }
}

/// Finishing work moved off the unpublish path: committing the tail
/// segment and deleting files is disk I/O the publisher need not wait on.
struct HlsReapTask {
    muxer: Arc<HlsMuxer>,
}

#[async_trait]
impl AsyncCallTask for HlsReapTask {
    async fn call(&self) -> ServerResult<()> {
        self.muxer.on_unpublish();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("hls-reap {}", self.muxer.req.stream_url())
    }
}

/// Drives one muxer per published stream off the live source hub.
pub struct HlsController {
    config: HlsConfig,
    registry: Arc<LiveSourceRegistry>,
    spawner: Arc<dyn TaskSpawner>,
    worker: Arc<AsyncCallWorker>,
    streams: DashMap<String, HlsStream>,
}

impl HlsController {
    /// Creates the controller; subscribe it to the source events.
    pub fn new(
        config: HlsConfig,
        registry: Arc<LiveSourceRegistry>,
        spawner: Arc<dyn TaskSpawner>,
        worker: Arc<AsyncCallWorker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            spawner,
            worker,
            streams: DashMap::new(),
        })
    }

    /// Active muxer count.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl SourceEventHandler for HlsController {
    fn on_publish(&self, req: &StreamRequest) {
        if !self.config.enabled || req.schema == "hls" {
            return;
        }
        let url = req.stream_url();
        if self.streams.contains_key(&url) {
            return;
        }

        let muxer = HlsMuxer::new(req.clone(), self.config.clone());
        let co = Coroutine::new("hls", ContextId::new());
        let cycle = Arc::new(HlsStreamCycle {
            co: Arc::clone(&co),
            muxer: Arc::clone(&muxer),
            registry: Arc::clone(&self.registry),
            url: url.clone(),
        });
        co.start(self.spawner.as_ref(), cycle);

        log::info!("[Hls] start muxing url={}", url);
        self.streams.insert(url, HlsStream { muxer, co });
    }

    fn on_unpublish(&self, req: &StreamRequest) {
        let url = req.stream_url();
        if let Some((_, stream)) = self.streams.remove(&url) {
            stream.co.stop();
            self.worker.execute(Box::new(HlsReapTask {
                muxer: stream.muxer,
            }));
            log::info!("[Hls] stop muxing url={}", url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        aac_frame_payload, aac_sequence_header_payload, avc_frame_payload,
        avc_sequence_header_payload, PacketKind,
    };
    use crate::protocol::mpegts::audio_specific_config;
    use crate::rtp::h264::{avc_decoder_configuration, avcc_join};
    use bytes::Bytes;

    fn config(dir: &std::path::Path) -> HlsConfig {
        HlsConfig {
            enabled: true,
            fragment_ms: 2000,
            window_ms: 6000,
            path: dir.to_path_buf(),
            ts_template: "[stream]-[seq].ts".into(),
            cleanup: true,
        }
    }

    fn req() -> StreamRequest {
        StreamRequest::new("rtmp", "example.com", "live", "livestream", 1935)
    }

    fn video_sh() -> Arc<MediaPacket> {
        let config =
            avc_decoder_configuration(&[0x67, 0x64, 0x00, 0x1f, 0xac], &[0x68, 0xeb, 0xec])
                .unwrap();
        MediaPacket::new(PacketKind::Video, 0, avc_sequence_header_payload(&config))
    }

    fn audio_sh() -> Arc<MediaPacket> {
        let asc = audio_specific_config(2, 4, 2);
        MediaPacket::new(PacketKind::Audio, 0, aac_sequence_header_payload(&asc))
    }

    fn keyframe(ts: i64) -> Arc<MediaPacket> {
        MediaPacket::new(
            PacketKind::Video,
            ts,
            avc_frame_payload(true, 0, &avcc_join(&[Bytes::from_static(&[0x65, 1, 2])])),
        )
    }

    fn interframe(ts: i64) -> Arc<MediaPacket> {
        MediaPacket::new(
            PacketKind::Video,
            ts,
            avc_frame_payload(false, 0, &avcc_join(&[Bytes::from_static(&[0x41, 3])])),
        )
    }

    fn audio(ts: i64) -> Arc<MediaPacket> {
        MediaPacket::new(PacketKind::Audio, ts, aac_frame_payload(&[0x21]))
    }

    #[test]
    fn segments_cut_on_keyframes_past_target() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = HlsMuxer::new(req(), config(dir.path()));

        muxer.on_frame(&video_sh()).unwrap();
        muxer.on_frame(&audio_sh()).unwrap();

        // First GOP spans the fragment target; the next keyframe cuts.
        muxer.on_frame(&keyframe(0)).unwrap();
        for ts in (40..=2000).step_by(40) {
            muxer.on_frame(&interframe(ts)).unwrap();
            muxer.on_frame(&audio(ts)).unwrap();
        }
        muxer.on_frame(&keyframe(2040)).unwrap();
        assert_eq!(muxer.segment_count(), 1);

        let playlist = std::fs::read_to_string(
            dir.path().join("live").join("livestream.m3u8"),
        )
        .unwrap();
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:2"));
        assert!(playlist.contains("livestream-0.ts"));

        let seg = dir.path().join("live").join("livestream-0.ts");
        let data = std::fs::read(&seg).unwrap();
        assert!(data.len() % 188 == 0 && !data.is_empty());
        assert_eq!(data[0], 0x47);
    }

    #[test]
    fn unpublish_commits_tail_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = HlsMuxer::new(req(), config(dir.path()));

        muxer.on_frame(&video_sh()).unwrap();
        muxer.on_frame(&keyframe(0)).unwrap();
        muxer.on_frame(&interframe(40)).unwrap();
        muxer.on_unpublish();

        // Cleanup removed segments and playlist.
        assert!(!dir.path().join("live").join("livestream.m3u8").exists());
        assert!(!dir.path().join("live").join("livestream-0.ts").exists());
    }

    #[test]
    fn audio_only_stream_opens_segments() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = HlsMuxer::new(req(), config(dir.path()));

        muxer.on_frame(&audio_sh()).unwrap();
        for ts in (0..2400).step_by(20) {
            muxer.on_frame(&audio(ts)).unwrap();
        }
        // Tail segment commits at reap.
        let mut state = muxer.state.lock();
        muxer.reap_segment(&mut state).unwrap();
        assert_eq!(state.window.size(), 1);
        assert!(state.window.first().unwrap().duration_ms() >= 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_muxes_published_streams() {
        use crate::context::ContextId;
        use crate::hub::live::ConsumerBounds;
        use crate::hub::SourceEvents;
        use crate::runtime::coroutine::TokioSpawner;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.cleanup = false;

        let events = SourceEvents::new();
        let registry = LiveSourceRegistry::new(ConsumerBounds::default(), Arc::clone(&events));
        let worker = Arc::new(AsyncCallWorker::new());
        worker.start(&TokioSpawner::current());
        let controller = HlsController::new(
            cfg,
            Arc::clone(&registry),
            Arc::new(TokioSpawner::current()),
            Arc::clone(&worker),
        );
        events.subscribe(Arc::clone(&controller) as Arc<dyn SourceEventHandler>);

        let r = req();
        let source = registry.fetch_or_create(&r);
        source.on_publish(&r, ContextId::from_str("pub1")).unwrap();
        assert_eq!(controller.stream_count(), 1);
        // Yield so the muxing coroutine attaches its consumer.
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        source.on_frame(&video_sh()).unwrap();
        source.on_frame(&keyframe(0)).unwrap();
        source.on_frame(&interframe(40)).unwrap();
        // Let the muxing coroutine drain the consumer queue.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        source.on_unpublish();
        assert_eq!(controller.stream_count(), 0);
        // The tail reap runs on the async worker.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // Tail segment committed and listed.
        let playlist = std::fs::read_to_string(
            dir.path().join("live").join("livestream.m3u8"),
        )
        .unwrap();
        assert!(playlist.contains("livestream-0.ts"));
        assert!(dir.path().join("live").join("livestream-0.ts").exists());
    }

    #[test]
    fn interframes_before_first_keyframe_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = HlsMuxer::new(req(), config(dir.path()));
        muxer.on_frame(&video_sh()).unwrap();
        muxer.on_frame(&interframe(0)).unwrap();
        assert!(muxer.state.lock().current.is_none());
    }
}
