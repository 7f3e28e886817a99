//! Editor HTTP surface and listener-facing static files.

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

use crate::auth::{Auth, Claims};
use crate::autodj::{AutoDj, DjConfig};
use crate::bus::ChangeBus;
use crate::error::Error;
use crate::live::{LiveController, LiveRequest};
use crate::model::{from_micros, Media, Segment, Tag};
use crate::source::{read_duration, SourceStore};
use crate::store::{timed, Store};

/// Uploads carry whole audio files
const UPLOAD_LIMIT: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub store: Store,
    pub bus: ChangeBus,
    pub auth: Auth,
    pub sources: SourceStore,
    pub dj: Arc<AutoDj>,
    pub live: Arc<LiveController>,
    /// Parent of every loop started through the API
    pub cancel: CancellationToken,
}

type SharedState = Arc<AppState>;

/// Core error rendered as `{"error": "<phrase>"}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Database(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Unix seconds, fractional allowed
fn unix_seconds(secs: f64) -> DateTime<Utc> {
    from_micros((secs * 1_000_000.0).round() as i64)
}

/// Claims of a verified `Authorization: Bearer` token
pub struct Bearer(pub Claims);

impl FromRequestParts<SharedState> for Bearer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError(Error::Unauthorized))?;
        Ok(Bearer(state.auth.verify(token.trim())?))
    }
}

/// Build the application router
pub fn router(state: SharedState, content_dir: &FsPath, manifest_path: &FsPath) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/login", post(login_handler))
        .route(
            "/schedule",
            get(schedule_handler)
                .post(create_segment_handler)
                .delete(clear_schedule_handler),
        )
        .route(
            "/schedule/{id}",
            get(segment_handler)
                .put(update_segment_handler)
                .delete(delete_segment_handler),
        )
        .route(
            "/schedule/dj/config",
            get(dj_config_handler).post(set_dj_config_handler),
        )
        .route("/schedule/dj/start", get(dj_start_handler))
        .route("/schedule/dj/stop", get(dj_stop_handler))
        .route("/schedule/dj/status", get(dj_status_handler))
        .route("/schedule/lives", get(lives_handler))
        .route("/schedule/live/start", post(live_start_handler))
        .route("/schedule/live/info", get(live_info_handler))
        .route("/schedule/live/stop", get(live_stop_handler))
        .route(
            "/library/media",
            get(media_list_handler)
                .post(upload_media_handler)
                .layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .route(
            "/library/media/{id}",
            get(media_handler).delete(delete_media_handler),
        )
        .route("/library/tags", get(tags_handler).post(create_tag_handler))
        .route_service("/manifest.mpd", ServeFile::new(manifest_path))
        .fallback_service(ServeDir::new(content_dir))
        .layer(cors)
        .with_state(state)
}

// ----------------------------------------------------------------------
// Auth
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginRequest {
    login: String,
    pass: String,
}

async fn login_handler(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let token = state.auth.login(&state.store, &req.login, &req.pass).await?;
    Ok(Json(json!({ "token": token })))
}

// ----------------------------------------------------------------------
// Schedule
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct RangeQuery {
    start: f64,
    stop: f64,
}

#[derive(Deserialize)]
struct FromQuery {
    from: f64,
}

async fn schedule_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Query(q): Query<RangeQuery>,
) -> ApiResult<Json<Vec<Segment>>> {
    if q.stop < q.start {
        return Err(Error::InvalidInput("stop is before start".to_string()).into());
    }
    let segments = timed(
        state
            .store
            .schedule_cut(unix_seconds(q.start), unix_seconds(q.stop)),
    )
    .await?;
    Ok(Json(segments))
}

async fn create_segment_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    Json(segment): Json<Segment>,
) -> ApiResult<Json<Value>> {
    if segment.is_live() {
        return Err(Error::InvalidInput("live segments are managed by the live controller".to_string()).into());
    }
    let id = timed(state.store.save_segment(&segment)).await?;
    state.bus.publish();
    info!("Editor '{}' scheduled segment {} at {}", claims.login, id, segment.start);
    Ok(Json(json!({ "id": id })))
}

async fn segment_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Path(id): Path<i64>,
) -> ApiResult<Json<Segment>> {
    Ok(Json(timed(state.store.segment(id)).await?))
}

/// Move or re-cut a segment; only `start`, `beginCut` and `stopCut` are used
async fn update_segment_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Path(id): Path<i64>,
    Json(mut segment): Json<Segment>,
) -> ApiResult<Json<Segment>> {
    segment.id = id;
    timed(state.store.update_segment_timing(&segment)).await?;
    state.bus.publish();
    Ok(Json(timed(state.store.segment(id)).await?))
}

async fn delete_segment_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    timed(state.store.delete_segment(id)).await?;
    state.bus.publish();
    info!("Editor '{}' deleted segment {}", claims.login, id);
    Ok(Json(json!({ "deleted": 1 })))
}

async fn clear_schedule_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    Query(q): Query<FromQuery>,
) -> ApiResult<Json<Value>> {
    let from = unix_seconds(q.from);
    let deleted = timed(state.store.clear_schedule(from)).await?;
    state.bus.publish();
    info!("Editor '{}' cleared {} segments from {}", claims.login, deleted, from);
    Ok(Json(json!({ "deleted": deleted })))
}

// ----------------------------------------------------------------------
// AutoDJ
// ----------------------------------------------------------------------

async fn dj_config_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
) -> Json<DjConfig> {
    Json(state.dj.config())
}

async fn set_dj_config_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Json(config): Json<DjConfig>,
) -> ApiResult<Json<DjConfig>> {
    timed(state.dj.set_config(config)).await?;
    Ok(Json(state.dj.config()))
}

async fn dj_start_handler(State(state): State<SharedState>, _editor: Bearer) -> Json<Value> {
    if !state.dj.is_playing() {
        let dj = Arc::clone(&state.dj);
        let cancel = state.cancel.child_token();
        tokio::spawn(async move { dj.run(cancel).await });
    }
    Json(json!({ "playing": true }))
}

async fn dj_stop_handler(State(state): State<SharedState>, _editor: Bearer) -> Json<Value> {
    let was_playing = state.dj.is_playing();
    if was_playing {
        state.dj.stop();
    }
    Json(json!({ "playing": false, "wasPlaying": was_playing }))
}

async fn dj_status_handler(State(state): State<SharedState>, _editor: Bearer) -> Json<Value> {
    Json(json!({ "playing": state.dj.is_playing(), "config": state.dj.config() }))
}

// ----------------------------------------------------------------------
// Live
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct LivesQuery {
    #[serde(default)]
    start: Option<f64>,
}

async fn lives_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Query(q): Query<LivesQuery>,
) -> ApiResult<Json<Value>> {
    let after = q.start.map(unix_seconds).unwrap_or_else(Utc::now);
    let lives = timed(state.store.lives(after)).await?;
    Ok(Json(json!(lives)))
}

async fn live_start_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    Json(req): Json<LiveRequest>,
) -> ApiResult<Json<Value>> {
    let name = req.name.clone();
    // Store calls inside are individually timed; dropping the whole start
    // midway would leave an open live record behind
    match state.live.start(req, state.cancel.child_token()).await? {
        Some(info) => {
            info!("Editor '{}' started live '{}'", claims.login, name);
            Ok(Json(json!(info)))
        }
        None => Err(Error::InvalidInput("live could not be started".to_string()).into()),
    }
}

async fn live_info_handler(State(state): State<SharedState>, _editor: Bearer) -> Json<Value> {
    Json(json!(state.live.info()))
}

async fn live_stop_handler(State(state): State<SharedState>, _editor: Bearer) -> Json<Value> {
    let was_playing = state.live.is_playing();
    if was_playing {
        state.live.stop();
    }
    Json(json!({ "wasPlaying": was_playing }))
}

// ----------------------------------------------------------------------
// Library
// ----------------------------------------------------------------------

/// JSON part of a media upload
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaUpload {
    name: String,
    #[serde(default)]
    author: String,
    /// Microseconds; read from the source when absent
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    tags: BTreeSet<i64>,
}

async fn media_list_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
) -> ApiResult<Json<Vec<Media>>> {
    Ok(Json(timed(state.store.media_list()).await?))
}

async fn media_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Path(id): Path<i64>,
) -> ApiResult<Json<Media>> {
    Ok(Json(timed(state.store.media(id)).await?))
}

async fn upload_media_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    mut multipart: Multipart,
) -> ApiResult<Json<Media>> {
    let mut source = None;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "source" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("bad source part: {}", e)))?;
                source = Some(data);
            }
            "media" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("bad media part: {}", e)))?;
                let parsed: MediaUpload = serde_json::from_str(&text)
                    .map_err(|e| Error::InvalidInput(format!("bad media json: {}", e)))?;
                upload = Some(parsed);
            }
            other => warn!("Ignoring unknown multipart field '{}'", other),
        }
    }
    let source = source.ok_or_else(|| Error::InvalidInput("missing source part".to_string()))?;
    let upload = upload.ok_or_else(|| Error::InvalidInput("missing media part".to_string()))?;

    let source_id = state.sources.put(&source).await.map_err(Error::Io)?;
    match store_media(&state, &source_id, upload).await {
        Ok(media) => {
            state.dj.library_changed();
            info!(
                "Editor '{}' uploaded media {} '{}' ({}ms)",
                claims.login,
                media.id,
                media.name,
                media.duration.num_milliseconds()
            );
            Ok(Json(media))
        }
        Err(e) => {
            if let Err(del) = state.sources.delete(&source_id).await {
                warn!("Failed to remove orphan source {}: {}", source_id, del);
            }
            Err(e.into())
        }
    }
}

async fn store_media(
    state: &AppState,
    source_id: &str,
    upload: MediaUpload,
) -> crate::error::Result<Media> {
    let duration = match upload.duration.filter(|us| *us > 0) {
        Some(us) => TimeDelta::microseconds(us),
        None => {
            let path = state.sources.path(source_id);
            tokio::task::spawn_blocking(move || read_duration(&path))
                .await
                .map_err(|e| Error::Internal(format!("duration task failed: {}", e)))?
                .map_err(|e| Error::InvalidInput(format!("unreadable audio: {}", e)))?
        }
    };
    let mut media = Media {
        id: 0,
        name: upload.name,
        author: upload.author,
        duration,
        source_id: source_id.to_string(),
        tags: upload.tags,
    };
    media.id = timed(state.store.new_media(&media)).await?;
    Ok(media)
}

async fn delete_media_handler(
    State(state): State<SharedState>,
    Bearer(claims): Bearer,
    Path(id): Path<i64>,
) -> ApiResult<Json<Media>> {
    let media = timed(state.store.delete_media(id)).await?;
    if let Err(e) = state.sources.delete(&media.source_id).await {
        warn!("Failed to remove source {} of media {}: {}", media.source_id, id, e);
    }
    state.dj.library_changed();
    info!("Editor '{}' deleted media {} '{}'", claims.login, id, media.name);
    Ok(Json(media))
}

async fn tags_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
) -> ApiResult<Json<Vec<Tag>>> {
    Ok(Json(timed(state.store.tags()).await?))
}

async fn create_tag_handler(
    State(state): State<SharedState>,
    _editor: Bearer,
    Json(mut tag): Json<Tag>,
) -> ApiResult<Json<Tag>> {
    tag.id = timed(state.store.new_tag(&tag)).await?;
    Ok(Json(tag))
}
