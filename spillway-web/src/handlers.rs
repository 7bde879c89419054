//! HTTP handlers: the byte relay endpoint, segmented-file serving, and
//! the status surface.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::json;
use spillway_core::capture::SessionSnapshot;
use tracing::debug;

use crate::server::AppState;

/// `GET /{site_id}/stream` - attaches the response to the site's relay
/// buffer and streams chunked bytes until the client disconnects or the
/// buffer stops.
///
/// The response never buffers server-side beyond the relay's own retained
/// window: the catch-up replay plus live chunks flow straight through.
pub async fn stream(State(state): State<AppState>, Path(site_id): Path<String>) -> Response {
    let Some(relay) = state.manager.relay(&site_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no active relay for {site_id}") })),
        )
            .into_response();
    };

    let sink = relay.attach();
    debug!("HTTP client attached to {site_id} relay");
    let body = Body::from_stream(sink.map(Ok::<_, std::convert::Infallible>));

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(body)
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `GET /hls/{site_id}/{file}` - serves the playlist and segments with
/// the cache semantics players expect: playlists must always be re-fetched,
/// segments are immutable for their lifetime.
pub async fn hls_file(
    State(state): State<AppState>,
    Path((site_id, file)): Path<(String, String)>,
) -> Response {
    if !is_safe_component(&site_id) || !is_safe_component(&file) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid path" })),
        )
            .into_response();
    }

    let path = state.hls_dir.join(&site_id).join(&file);
    let Ok(content) = tokio::fs::read(&path).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no such segment or playlist" })),
        )
            .into_response();
    };

    let (content_type, cache_control) = if file.ends_with(".m3u8") {
        ("application/vnd.apple.mpegurl", "no-cache, no-store, must-revalidate")
    } else if file.ends_with(".ts") {
        ("video/mp2t", "public, max-age=60")
    } else {
        ("application/octet-stream", "no-cache")
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(content))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `GET /{site_id}/status`
pub async fn site_status(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(snapshot) = state.manager.status(&site_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no session for {site_id}") })),
        )
            .into_response();
    };
    let base = base_url(&headers, &state);
    Json(snapshot_json(&snapshot, &base)).into_response()
}

/// `GET /status` - server totals plus per-stream details.
pub async fn server_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let base = base_url(&headers, &state);
    let snapshots = state.manager.status_all().await;
    let active = snapshots.iter().filter(|s| s.is_running()).count();

    let mut streams = serde_json::Map::new();
    for snapshot in &snapshots {
        streams.insert(snapshot.site_id.clone(), snapshot_json(snapshot, &base));
    }

    Json(json!({
        "server": "Spillway Stream Relay",
        "version": env!("CARGO_PKG_VERSION"),
        "totalSessions": snapshots.len(),
        "activeSessions": active,
        "serverUptimeSecs": state.started_at.elapsed().as_secs(),
        "streams": streams,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// `GET /streams` - compact listing of running streams.
pub async fn streams_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let base = base_url(&headers, &state);
    let mut streams = serde_json::Map::new();
    for snapshot in state.manager.status_all().await {
        if !snapshot.is_running() {
            continue;
        }
        streams.insert(
            snapshot.site_id.clone(),
            json!({
                "name": snapshot.site_name,
                "status": snapshot.status,
                "uptimeSecs": snapshot.uptime.as_secs(),
                "streamUrl": stream_url(&snapshot, &base),
                "segmentCount": snapshot.hls.as_ref().map(|h| h.segment_count),
            }),
        );
    }
    Json(serde_json::Value::Object(streams)).into_response()
}

/// `GET /playlist.m3u` - M3U lineup for TV-tuner backends and IPTV players.
pub async fn playlist_m3u(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let base = base_url(&headers, &state);
    let mut content = String::from("#EXTM3U\n");
    for snapshot in state.manager.status_all().await {
        if !snapshot.is_running() {
            continue;
        }
        content.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{id}\" tvg-name=\"{name}\" group-title=\"Live Streams\",{name}\n{url}\n",
            id = snapshot.site_id,
            name = snapshot.site_name,
            url = stream_url(&snapshot, &base),
        ));
    }

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .body(Body::from(content))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `GET /` - endpoint index.
pub async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "server": "Spillway Stream Relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "stream": "/{site_id}/stream (live byte relay)",
            "hls": "/hls/{site_id}/stream.m3u8 (segmented playlist)",
            "siteStatus": "/{site_id}/status",
            "status": "/status",
            "streams": "/streams",
            "playlist": "/playlist.m3u",
            "health": "/health",
        },
    }))
}

/// The URL a player should open for this session, depending on topology.
fn stream_url(snapshot: &SessionSnapshot, base: &str) -> String {
    match &snapshot.playlist_url {
        Some(playlist) => format!("{base}{playlist}"),
        None => format!("{base}/{}/stream", snapshot.site_id),
    }
}

fn snapshot_json(snapshot: &SessionSnapshot, base: &str) -> serde_json::Value {
    json!({
        "siteId": snapshot.site_id,
        "siteName": snapshot.site_name,
        "status": snapshot.status,
        "isRunning": snapshot.is_running(),
        "uptimeSecs": snapshot.uptime.as_secs(),
        "restartCount": snapshot.restart_count,
        "source": snapshot.source,
        "channelPath": snapshot.channel_path.as_ref().map(|p| p.display().to_string()),
        "relay": snapshot.relay.as_ref().map(|r| json!({
            "bytesRead": r.bytes_read,
            "chunkCount": r.chunk_count,
            "bufferedBytes": r.buffered_bytes,
            "attachedSinks": r.attached_sinks,
            "uptimeSecs": r.uptime.as_secs(),
        })),
        "hls": snapshot.hls.as_ref().map(|h| json!({
            "segmentCount": h.segment_count,
            "playlistBytes": h.playlist_bytes,
        })),
        "streamUrl": stream_url(snapshot, base),
    })
}

fn base_url(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_else(|| state.fallback_base_url.trim_end_matches('/').to_string())
}

fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && !component.contains('/')
        && !component.contains('\\')
        && component != "."
        && component != ".."
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::http::Request;
    use spillway_core::capture::{SessionManager, StaticStreamFinder};
    use spillway_core::config::SpillwayConfig;
    use spillway_core::tvheadend::M3uRegistrar;
    use tower::ServiceExt;

    use super::*;
    use crate::server::{AppState, router};

    fn test_state(hls_dir: &std::path::Path) -> AppState {
        let mut config = SpillwayConfig::default();
        config.transcode.hls_dir = hls_dir.to_path_buf();
        let registrar = M3uRegistrar::new(config.tvheadend.clone());
        let manager = Arc::new(SessionManager::new(
            config,
            Arc::new(StaticStreamFinder),
            Arc::new(registrar),
        ));
        AppState::new(manager)
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, body.to_vec(), content_type)
    }

    #[tokio::test]
    async fn health_and_index_respond() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body, _) = get(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");

        let (status, body, _) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["endpoints"]["stream"].is_string());
    }

    #[tokio::test]
    async fn stream_without_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, _, _) = get(app.clone(), "/arena/stream").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = get(app, "/arena/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_server_status_reports_zero_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body, _) = get(app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["totalSessions"], 0);
        assert_eq!(value["activeSessions"], 0);
    }

    #[tokio::test]
    async fn playlist_is_m3u_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body, content_type) = get(app, "/playlist.m3u").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/vnd.apple.mpegurl"));
        assert!(String::from_utf8(body).unwrap().starts_with("#EXTM3U\n"));
    }

    #[tokio::test]
    async fn hls_serving_sets_per_type_headers() {
        let dir = tempfile::tempdir().unwrap();
        let site_dir = dir.path().join("arena");
        std::fs::create_dir_all(&site_dir).unwrap();
        std::fs::write(site_dir.join("stream.m3u8"), "#EXTM3U\nsegment_000.ts\n").unwrap();
        std::fs::write(site_dir.join("segment_000.ts"), b"\x47payload").unwrap();

        let app = router(test_state(dir.path()));

        let (status, body, content_type) = get(app.clone(), "/hls/arena/stream.m3u8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/vnd.apple.mpegurl"));
        assert!(String::from_utf8(body).unwrap().contains("segment_000.ts"));

        let (status, _, content_type) = get(app.clone(), "/hls/arena/segment_000.ts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("video/mp2t"));

        let (status, _, _) = get(app, "/hls/arena/missing.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, _, _) = get(app, "/hls/arena/..").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn safe_component_rules() {
        assert!(is_safe_component("stream.m3u8"));
        assert!(is_safe_component("segment_000.ts"));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component(""));
    }
}
