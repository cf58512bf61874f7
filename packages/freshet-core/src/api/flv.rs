//! HTTP-FLV player handler.
//!
//! The response body is the FLV header followed by one tag per media
//! packet pulled off a hub consumer. A consumer overflow or source
//! teardown ends the body; the player reconnects if it wants more.

use std::time::Duration;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;

use crate::api::AppState;
use crate::context::ContextId;
use crate::error::{ServerError, ServerResult};
use crate::protocol::flv;
use crate::request::StreamRequest;

const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Streams a live source as FLV over HTTP.
pub async fn serve_flv_stream(state: AppState, req: StreamRequest) -> ServerResult<Response> {
    let url = req.stream_url();
    let source = state
        .adapter
        .live
        .find(&url)
        .filter(|s| s.is_active())
        .ok_or_else(|| ServerError::StreamNotFound(url.clone()))?;

    let cid = ContextId::new();
    let consumer = source.create_consumer(cid);
    let mut print = state.adapter.prints.http_stream();
    log::info!("[Flv] play url={} cid={}", url, cid);

    let body = async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(flv::file_header(true, true));

        loop {
            match consumer.dequeue(DEQUEUE_TIMEOUT).await {
                Ok(Some(pkt)) => {
                    print.elapse();
                    if print.can_print() {
                        log::info!(
                            "[Flv] -> play cid={} age={}s queue={}",
                            cid,
                            print.age().as_secs(),
                            consumer.len()
                        );
                    }
                    yield Ok(flv::encode_packet(&pkt));
                }
                Ok(None) => {
                    log::info!("[Flv] stream ended cid={}", cid);
                    break;
                }
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    log::warn!("[Flv] drop player cid={}: {}", cid, err);
                    yield Err(std::io::Error::other(err.to_string()));
                    break;
                }
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameTarget;
    use crate::packet::{avc_frame_payload, MediaPacket, PacketKind};

    #[tokio::test]
    async fn absent_stream_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = crate::api::tests::test_state(dir.path());
        let req = StreamRequest::new("flv", "127.0.0.1", "live", "missing", 8080);
        let err = serve_flv_stream(state, req).await.unwrap_err();
        assert!(matches!(err, ServerError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn body_starts_with_flv_header_then_tags() {
        let dir = tempfile::tempdir().unwrap();
        let state = crate::api::tests::test_state(dir.path());

        let req = StreamRequest::new("flv", "127.0.0.1", "live", "x", 8080);
        let source = state.adapter.live.fetch_or_create(&req);
        source.on_publish(&req, ContextId::from_str("pub1")).unwrap();

        let resp = serve_flv_stream(state, req).await.unwrap();

        // Feed one frame, then unpublish so the body ends.
        source
            .on_frame(&MediaPacket::new(
                PacketKind::Video,
                40,
                avc_frame_payload(true, 0, &[0, 0, 0, 1, 0x65]),
            ))
            .unwrap();
        source.on_unpublish();

        let collected = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(&collected[..3], b"FLV");
        // Tag 0 after the 13-byte preamble is a video tag.
        assert_eq!(collected[13], flv::tag_type::VIDEO);
    }
}
