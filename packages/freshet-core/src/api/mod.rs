//! HTTP surface: HTTP-FLV players, HLS playlist/segment serving and the
//! cluster redirect API.
//!
//! Handlers are thin; streaming state lives in the hub and the HLS layer.

mod flv;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::conn::AdapterContext;
use crate::context::NetworkContext;
use crate::coworkers::CoworkerDirectory;
use crate::error::{ServerError, ServerResult};
use crate::hls::muxer::HlsConfig;
use crate::hls::session::HlsSessionStore;
use crate::request::StreamRequest;

pub use flv::serve_flv_stream;

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    pub adapter: AdapterContext,
    pub sessions: Arc<HlsSessionStore>,
    pub coworkers: Arc<CoworkerDirectory>,
    pub hls: HlsConfig,
    pub network: NetworkContext,
}

/// Builds the router for the streaming HTTP endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/clusters", get(clusters))
        .route("/{app}/{file}", get(serve_media))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"code": 0}))
}

/// Coworker redirect hints for cluster peers.
async fn clusters(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let vhost = params.get("vhost").cloned().unwrap_or_default();
    let coworker = params.get("coworker").cloned().unwrap_or_default();
    let app = params.get("app").cloned().unwrap_or_default();
    let stream = params.get("stream").cloned().unwrap_or_default();

    let data = state.coworkers.dumps(&vhost, &coworker, &app, &stream);
    Json(json!({"code": 0, "data": data}))
}

/// Dispatches `/{app}/{file}` on the file extension: `.flv` players,
/// `.m3u8` playlists, `.ts` segments.
async fn serve_media(
    Path((app, file)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> ServerResult<Response> {
    if app.contains("..") || file.contains("..") || file.contains('/') {
        return Err(ServerError::InvalidRequest("path traversal".into()));
    }

    if let Some(stream) = file.strip_suffix(".flv") {
        let req = media_request(&state, "flv", &app, stream, &params);
        return serve_flv_stream(state, req).await;
    }
    if let Some(stream) = file.strip_suffix(".m3u8") {
        let req = media_request(&state, "hls", &app, stream, &params);
        return serve_playlist(state, req, &app, &file, &params).await;
    }
    if file.ends_with(".ts") {
        return serve_segment(state, &app, &file, &params).await;
    }
    Err(ServerError::StreamNotFound(format!("{}/{}", app, file)))
}

fn media_request(
    state: &AppState,
    schema: &str,
    app: &str,
    stream: &str,
    params: &HashMap<String, String>,
) -> StreamRequest {
    let param = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    StreamRequest::new(
        schema,
        state.network.get_local_ip(),
        app,
        stream,
        state.network.get_port(),
    )
    .with_param(param)
}

/// Serves the playlist, creating or refreshing the player's session.
async fn serve_playlist(
    state: AppState,
    req: StreamRequest,
    app: &str,
    file: &str,
    params: &HashMap<String, String>,
) -> ServerResult<Response> {
    let ctx = params
        .get("hls_ctx")
        .cloned()
        .unwrap_or_else(|| crate::context::ContextId::new().to_string());
    state.sessions.create_or_refresh(&ctx, &req);

    let path = state.hls.path.join(app).join(file);
    let playlist = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| ServerError::StreamNotFound(req.stream_url()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist,
    )
        .into_response())
}

/// Serves one committed segment after validating the session.
async fn serve_segment(
    state: AppState,
    app: &str,
    file: &str,
    params: &HashMap<String, String>,
) -> ServerResult<Response> {
    if let Some(ctx) = params.get("hls_ctx") {
        state.sessions.validate(ctx)?;
    }

    let path = state.hls.path.join(app).join(file);
    let data = tokio::fs::read(&path)
        .await
        .map_err(|_| ServerError::StreamNotFound(format!("{}/{}", app, file)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        data,
    )
        .into_response())
}

/// Binds and serves the HTTP endpoint until shutdown.
pub async fn start_server(state: AppState, port: u16) -> ServerResult<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("[Http] listening on :{}", port);
    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Internal(format!("http server: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker, CpuSource};
    use crate::clock::TokioClock;
    use crate::hub::{live::ConsumerBounds, LiveSourceRegistry, RtcSourceRegistry, SourceEvents,
        SrtSourceRegistry};
    use crate::pithy::PithyPrints;
    use crate::runtime::coroutine::TokioSpawner;
    use crate::token::PublishTokenManager;
    use std::time::Duration;

    struct IdleCpu;
    impl CpuSource for IdleCpu {
        fn cpu_percent(&self) -> f32 {
            0.0
        }
    }

    pub(super) fn test_state(hls_dir: &std::path::Path) -> AppState {
        let events = SourceEvents::new();
        let network = NetworkContext::for_test();
        AppState {
            adapter: AdapterContext {
                live: LiveSourceRegistry::new(ConsumerBounds::default(), Arc::clone(&events)),
                rtc: RtcSourceRegistry::new(ConsumerBounds::default(), Arc::clone(&events)),
                srt: SrtSourceRegistry::new(64, events),
                tokens: PublishTokenManager::new(),
                prints: PithyPrints::new(Duration::from_secs(10), TokioClock::arc()),
                breaker: CircuitBreaker::new(BreakerConfig::default(), Arc::new(IdleCpu)),
                spawner: Arc::new(TokioSpawner::current()),
                clock: TokioClock::arc(),
                rtmp_to_rtc: false,
            },
            sessions: HlsSessionStore::new(Duration::from_secs(30), TokioClock::arc()),
            coworkers: CoworkerDirectory::new(network.clone(), "", 1935, 1985),
            hls: HlsConfig {
                enabled: true,
                path: hls_dir.to_path_buf(),
                ..Default::default()
            },
            network,
        }
    }

    #[tokio::test]
    async fn playlist_request_creates_session_and_serves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("live")).unwrap();
        std::fs::write(
            dir.path().join("live").join("x.m3u8"),
            "#EXTM3U\n#EXT-X-VERSION:3\n",
        )
        .unwrap();

        let state = test_state(dir.path());
        let req = StreamRequest::new("hls", "h", "live", "x", 8080);
        let mut params = HashMap::new();
        params.insert("hls_ctx".to_string(), "abc123".to_string());

        let resp = serve_playlist(state.clone(), req, "live", "x.m3u8", &params)
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        assert_eq!(state.sessions.len(), 1);
        assert!(state.sessions.validate("abc123").is_ok());
    }

    #[tokio::test]
    async fn segment_request_requires_live_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("live")).unwrap();
        std::fs::write(dir.path().join("live").join("x-0.ts"), [0x47u8; 188]).unwrap();

        let state = test_state(dir.path());
        let mut params = HashMap::new();
        params.insert("hls_ctx".to_string(), "nope".to_string());

        let err = serve_segment(state.clone(), "live", "x-0.ts", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::SessionNotFound(_)));

        // With a session established, the segment is served.
        let req = StreamRequest::new("hls", "h", "live", "x", 8080);
        state.sessions.create_or_refresh("nope", &req);
        let resp = serve_segment(state, "live", "x-0.ts", &params).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let err = serve_media(
            Path(("live".to_string(), "..secret.ts".to_string())),
            Query(HashMap::new()),
            State(state),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
