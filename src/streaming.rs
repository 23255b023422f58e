//! Streaming Server: translates HTTP verbs into Planner/Session
//! Manager/Content Store operations and serves manifests, segments, and
//! direct-play files with Range support.
//!
//! `HEAD` is not handled specially here: axum serves `HEAD` from the same
//! `GET` handler and strips the body afterwards, which already gives the
//! expected "same headers, no body" behaviour.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::content_store::ContentStore;
use crate::domain::{DeviceProfile, PlaybackDecision, TranscodeRequest};
use crate::error::{CoreError, CoreResult};
use crate::planner::Planner;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct StreamingState {
    pub planner: Arc<Planner>,
    pub sessions: Arc<SessionManager>,
    pub content_store: Arc<ContentStore>,
}

pub fn router() -> Router<StreamingState> {
    Router::new()
        .route("/playback/decide", post(decide))
        .route("/playback/start", post(start))
        .route("/playback/session/{id}", get(get_session).delete(stop_session))
        .route("/playback/stream/{id}/manifest.mpd", get(stream_manifest))
        .route("/playback/stream/{id}/playlist.m3u8", get(stream_playlist))
        .route("/playback/stream/{id}/segment/{name}", get(stream_segment))
        .route("/content/{hash}/{file}", get(content_file))
        .route("/media/files/{id}/stream", get(direct_play))
        .route("/healthz", get(healthz))
}

#[derive(Debug, Deserialize)]
struct DecideRequest {
    input_path: PathBuf,
    device_profile: DeviceProfile,
}

async fn decide(
    State(state): State<StreamingState>,
    Json(req): Json<DecideRequest>,
) -> CoreResult<Json<PlaybackDecision>> {
    let decision = state.planner.decide(&req.input_path, &req.device_profile).await?;
    Ok(Json(decision))
}

async fn start(
    State(state): State<StreamingState>,
    Json(req): Json<TranscodeRequest>,
) -> CoreResult<Json<crate::session::SessionSummary>> {
    let summary = state.sessions.create_session(req).await?;
    Ok(Json(summary))
}

async fn get_session(
    State(state): State<StreamingState>,
    AxumPath(id): AxumPath<String>,
) -> CoreResult<Json<crate::session::SessionSummary>> {
    let summary = state.sessions.get_session(&id).await?;
    Ok(Json(summary))
}

async fn stop_session(
    State(state): State<StreamingState>,
    AxumPath(id): AxumPath<String>,
) -> CoreResult<StatusCode> {
    state.sessions.stop_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_manifest(
    State(state): State<StreamingState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    serve_session_file(&state, &id, "manifest.mpd", "application/dash+xml", headers).await
}

async fn stream_playlist(
    State(state): State<StreamingState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    serve_session_file(&state, &id, "master.m3u8", "application/vnd.apple.mpegurl", headers).await
}

async fn stream_segment(
    State(state): State<StreamingState>,
    AxumPath((id, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let content_type = mime_for_name(&name);
    serve_session_file(&state, &id, &name, content_type, headers).await
}

async fn serve_session_file(
    state: &StreamingState,
    session_id: &str,
    file_name: &str,
    content_type: &str,
    headers: HeaderMap,
) -> Response {
    let summary = match state.sessions.get_session(session_id).await {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    // Session-local files are not yet immutable content (the supervisor may
    // still be writing them), so no Cache-Control/ETag — just the bytes.
    let dir = match state.content_store.locate(&summary.content_hash).await {
        Ok((dir, _)) => dir,
        Err(e) => return e.into_response(),
    };
    serve_path(&dir.join(file_name), content_type, None, headers.get(header::RANGE)).await
}

async fn content_file(
    State(state): State<StreamingState>,
    AxumPath((hash, file)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let (dir, _status) = match state.content_store.locate(&hash).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let content_type = mime_for_name(&file);
    let etag = strong_etag(&hash, &file);
    serve_path(&dir.join(&file), content_type, Some(etag), headers.get(header::RANGE)).await
}

async fn direct_play(AxumPath(id): AxumPath<String>, headers: HeaderMap) -> Response {
    let path = PathBuf::from(id);
    serve_path(&path, "video/mp4", None, headers.get(header::RANGE)).await
}

#[derive(serde::Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn healthz() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

fn mime_for_name(name: &str) -> &'static str {
    if name.ends_with(".mpd") {
        "application/dash+xml"
    } else if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".m4s") {
        "video/iso.segment"
    } else if name.ends_with(".mp4") {
        "video/mp4"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        mime_guess::from_path(name).first_raw().unwrap_or("application/octet-stream")
    }
}

fn strong_etag(hash: &str, file: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update(b"/");
    hasher.update(file.as_bytes());
    format!("\"{:x}\"", hasher.finalize())
}

/// Serve `path` with optional immutable caching headers and byte-range
/// support. `416` on an unsatisfiable range, `206` with `Content-Range` on a
/// satisfiable one, `200` otherwise.
async fn serve_path(
    path: &Path,
    content_type: &str,
    immutable_etag: Option<String>,
    range: Option<&HeaderValue>,
) -> Response {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => return CoreError::NotFound(format!("{}: {}", path.display(), e)).into_response(),
    };
    let file_len = metadata.len();

    let mut base_headers = HeaderMap::new();
    base_headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    base_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(etag) = &immutable_etag {
        base_headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
        base_headers.insert(header::ETAG, HeaderValue::from_str(etag).unwrap());
        base_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    }

    let parsed_range = range.and_then(|v| v.to_str().ok()).and_then(parse_range_header);

    if let Some((start, end)) = parsed_range {
        let end = end.unwrap_or(file_len.saturating_sub(1));
        if start >= file_len || start > end {
            base_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{}", file_len)).unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, base_headers).into_response();
        }
        let end = end.min(file_len.saturating_sub(1));
        let length = end - start + 1;

        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => return CoreError::NotFound(format!("{}: {}", path.display(), e)).into_response(),
        };
        if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
            return CoreError::FileUnavailable(format!("seek failed on {}", path.display())).into_response();
        }

        base_headers.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&length.to_string()).unwrap());
        base_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, file_len)).unwrap(),
        );

        let stream = ReaderStream::new(file.take(length));
        let body = Body::from_stream(stream);
        let mut response = (StatusCode::PARTIAL_CONTENT, base_headers, body).into_response();
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        return response;
    }

    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => return CoreError::NotFound(format!("{}: {}", path.display(), e)).into_response(),
    };
    base_headers.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&file_len.to_string()).unwrap());
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    (StatusCode::OK, base_headers, body).into_response()
}

/// Parses `Range: bytes=a-b` / `bytes=a-` into `(start, Option<end>)`.
/// Anything else (multi-range, `bytes=-N` suffix form, malformed) returns
/// `None` and the caller falls back to a full 200 response.
fn parse_range_header(raw: &str) -> Option<(u64, Option<u64>)> {
    let raw = raw.strip_prefix("bytes=")?;
    if raw.contains(',') {
        return None;
    }
    let (start, end) = raw.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { None } else { end.parse::<u64>().ok() };
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bounded_range() {
        assert_eq!(parse_range_header("bytes=0-1023"), Some((0, Some(1023))));
    }

    #[test]
    fn parses_open_ended_range() {
        assert_eq!(parse_range_header("bytes=512-"), Some((512, None)));
    }

    #[test]
    fn rejects_multi_range() {
        assert_eq!(parse_range_header("bytes=0-10,20-30"), None);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse_range_header("nonsense"), None);
    }

    #[test]
    fn mime_mapping_matches_wire_format_table() {
        assert_eq!(mime_for_name("manifest.mpd"), "application/dash+xml");
        assert_eq!(mime_for_name("master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(mime_for_name("chunk-0-00001.m4s"), "video/iso.segment");
        assert_eq!(mime_for_name("output.mp4"), "video/mp4");
    }
}
