//! HTTP front end.
//!
//! Serves share consumption, per-track playback, the channel relay,
//! channel status and a small admin API.

use crate::catalog::{CatalogError, CatalogObject};
use crate::channel::relay::listener_response;
use crate::channel::{ChannelDraft, ChannelError, ChannelSupervisor};
use crate::gateway::{ConsumeOutcome, ConsumeRequest, DeliveryGateway, GatewayError};
use crate::object::{ObjectRef, ObjectType};
use crate::playlist::PlaylistFormat;
use crate::share::{Share, ShareDraft};
use crate::store::{ShareStore, StoreError};
use crate::unix_now;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // The denial reason was logged by the gateway and stays server side.
            ServerError::Gateway(GatewayError::Denied(_)) => {
                return (StatusCode::FORBIDDEN, "Access denied").into_response()
            }
            ServerError::Gateway(GatewayError::Catalog(CatalogError::NotFound(_)))
            | ServerError::Channel(ChannelError::NotFound(_))
            | ServerError::Channel(ChannelError::Catalog(CatalogError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            ServerError::Channel(ChannelError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ServerError::Channel(ChannelError::Full(_))
            | ServerError::Channel(ChannelError::NotRunning(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Channel(ChannelError::Start(_)) => StatusCode::BAD_GATEWAY,
            ServerError::Io(_)
            | ServerError::Internal(_)
            | ServerError::Gateway(_)
            | ServerError::Channel(_)
            | ServerError::Store(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ChannelSupervisor>,
    pub gateway: Arc<DeliveryGateway>,
    pub shares: Arc<dyn ShareStore>,
    /// External base URL, no trailing slash
    pub web_path: String,
    pub admin_token: Option<String>,
    pub channels_enabled: bool,
}

impl AppState {
    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ServerError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Ok(());
        };
        match headers.get(ADMIN_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            Some(presented) if presented == expected => Ok(()),
            _ => Err(ServerError::Unauthorized),
        }
    }

    fn require_channels(&self) -> Result<(), ServerError> {
        if self.channels_enabled {
            Ok(())
        } else {
            Err(ServerError::NotFound)
        }
    }
}

/// Creates the axum Router with every endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/share/consume", get(consume_share))
        .route("/play", get(play_track))
        .route("/channels", get(list_channels))
        .route("/channel/:id/:file", get(channel_file))
        .route("/admin/channels", post(create_channel))
        .route(
            "/admin/channels/:id",
            put(update_channel).delete(delete_channel),
        )
        .route("/admin/channels/:id/start", post(start_channel))
        .route("/admin/channels/:id/stop", post(stop_channel))
        .route("/admin/shares", post(create_share))
        .route("/admin/shares/:id", axum::routing::delete(delete_share))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ConsumeParams {
    id: Option<String>,
    secret: Option<String>,
    action: Option<String>,
    format: Option<String>,
}

async fn consume_share(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConsumeParams>,
) -> Result<Response, ServerError> {
    // A malformed id is just a share that does not exist.
    let share_id = params
        .id
        .as_deref()
        .and_then(|id| id.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let request = ConsumeRequest {
        share_id,
        secret: params.secret.unwrap_or_default(),
        action: params.action,
    };
    let format = match params.format.as_deref() {
        None | Some("") => PlaylistFormat::default(),
        Some(raw) => raw
            .parse::<PlaylistFormat>()
            .map_err(|e| ServerError::BadRequest(e.to_string()))?,
    };

    let gateway = state.gateway.clone();
    let outcome = tokio::task::spawn_blocking(move || gateway.consume(&request, remote.ip()))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    match outcome {
        ConsumeOutcome::Playlist(playlist) => Ok((
            [(header::CONTENT_TYPE, format.content_type())],
            playlist.render(format, &state.web_path),
        )
            .into_response()),
        ConsumeOutcome::Download(file) => serve_file(&file, true).await,
        ConsumeOutcome::View(object) => Ok(Redirect::to(&format!(
            "{}/view/{}/{}",
            state.web_path, object.object_type, object.object_id
        ))
        .into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct PlayParams {
    #[serde(rename = "type")]
    object_type: String,
    oid: i64,
    share_id: Option<String>,
    share_secret: Option<String>,
}

async fn play_track(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<PlayParams>,
) -> Result<Response, ServerError> {
    let object_type = params
        .object_type
        .parse::<ObjectType>()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let object = ObjectRef::new(object_type, params.oid);
    let share_id = params
        .share_id
        .as_deref()
        .and_then(|id| id.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let secret = params.share_secret.unwrap_or_default();

    let gateway = state.gateway.clone();
    let file = tokio::task::spawn_blocking(move || {
        gateway.authorize_track(share_id, &secret, &object, remote.ip())
    })
    .await
    .map_err(|e| ServerError::Internal(e.to_string()))??;

    serve_file(&file, false).await
}

fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("oga") | Some("opus") => "audio/ogg",
        Some("m4a") | Some("aac") => "audio/aac",
        Some("wav") => "audio/wav",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

async fn serve_file(object: &CatalogObject, attachment: bool) -> Result<Response, ServerError> {
    let Some(path) = object.path.as_deref() else {
        return Err(ServerError::NotFound);
    };
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            warn!(object = %object.object, path = %path.display(), "media file missing");
            ServerError::NotFound
        } else {
            ServerError::Io(e)
        }
    })?;
    let len = file.metadata().await?.len();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "'"))
        .unwrap_or_else(|| object.object.to_string());
    let disposition = format!(
        "{}; filename=\"{}\"",
        if attachment { "attachment" } else { "inline" },
        name
    );

    debug!(object = %object.object, bytes = len, "serving media file");
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(path).to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn list_channels(State(state): State<AppState>) -> Result<Response, ServerError> {
    state.require_channels()?;
    let statuses = state.supervisor.statuses(&state.web_path, false).await?;
    Ok(Json(statuses).into_response())
}

async fn channel_file(
    State(state): State<AppState>,
    Path((id, file)): Path<(i64, String)>,
) -> Result<Response, ServerError> {
    state.require_channels()?;
    if file == "status.xsl" {
        return channel_status(&state, id).await;
    }
    match file.strip_prefix("stream.") {
        Some(ext) => channel_stream(&state, id, ext).await,
        None => Err(ServerError::NotFound),
    }
}

async fn channel_status(state: &AppState, id: i64) -> Result<Response, ServerError> {
    let channel = state
        .supervisor
        .store()
        .channel(id)?
        .ok_or(ServerError::NotFound)?;
    Ok(Json(state.supervisor.status(&channel, &state.web_path).await).into_response())
}

async fn channel_stream(state: &AppState, id: i64, ext: &str) -> Result<Response, ServerError> {
    let channel = state.supervisor.ensure_running(id).await?;
    if ext != channel.stream_type.extension() {
        return Err(ServerError::NotFound);
    }
    let listener = state.supervisor.admit_listener(&channel)?;
    debug!(
        channel_id = id,
        peak = listener.count().peak_listeners,
        "relaying channel"
    );
    Ok(listener_response(channel.stream_type, listener))
}

async fn create_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<ChannelDraft>,
) -> Result<Response, ServerError> {
    state.require_admin(&headers)?;
    draft.validate()?;
    let channel = state.supervisor.store().insert_channel(&draft)?;
    info!(channel_id = channel.id, name = %channel.name, "channel created");
    let status = state.supervisor.status(&channel, &state.web_path).await;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

async fn update_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(draft): Json<ChannelDraft>,
) -> Result<Response, ServerError> {
    state.require_admin(&headers)?;
    let channel = state.supervisor.update(id, &draft).await?;
    Ok(Json(state.supervisor.status(&channel, &state.web_path).await).into_response())
}

async fn delete_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServerError> {
    state.require_admin(&headers)?;
    state.supervisor.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    state.require_admin(&headers)?;
    let channel = state.supervisor.ensure_running(id).await?;
    Ok(Json(state.supervisor.status(&channel, &state.web_path).await).into_response())
}

async fn stop_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    state.require_admin(&headers)?;
    state.supervisor.stop(id).await?;
    let channel = state
        .supervisor
        .store()
        .channel(id)?
        .ok_or(ServerError::NotFound)?;
    Ok(Json(state.supervisor.status(&channel, &state.web_path).await).into_response())
}

async fn create_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<ShareDraft>,
) -> Result<(StatusCode, Json<Share>), ServerError> {
    state.require_admin(&headers)?;
    draft
        .validate()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let share = state.shares.insert_share(&draft, unix_now())?;
    info!(share_id = share.id, object = %share.object, "share created");
    Ok((StatusCode::CREATED, Json(share)))
}

async fn delete_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServerError> {
    state.require_admin(&headers)?;
    if state.shares.delete_share(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::supervisor::tests::{
        script_launcher, seed_playlist, wait_for_listeners, FakeLauncher, FakeMode,
    };
    use crate::channel::{probe, ChannelStatus, SupervisorSettings};
    use crate::encode::EncoderLauncher;
    use crate::gateway::AccessPolicy;
    use crate::store::{ChannelStore, SqliteStore};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::body::Bytes;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const AUDIO: &[u8] = b"ID3\x04fake-audio-frames";

    struct Harness {
        _dir: TempDir,
        store: Arc<SqliteStore>,
        state: AppState,
    }

    fn harness(launcher: Arc<dyn EncoderLauncher>, admin_token: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let settings = SupervisorSettings {
            work_dir: dir.path().join("work"),
            startup_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(200),
            default_port: 0,
        };
        let supervisor = Arc::new(ChannelSupervisor::new(
            store.clone(),
            store.clone(),
            launcher,
            settings,
        ));
        let gateway = Arc::new(DeliveryGateway::new(
            store.clone(),
            store.clone(),
            AccessPolicy::default(),
        ));
        let state = AppState {
            supervisor,
            gateway,
            shares: store.clone(),
            web_path: "http://relay.test".to_string(),
            admin_token: admin_token.map(String::from),
            channels_enabled: true,
        };
        Harness {
            _dir: dir,
            store,
            state,
        }
    }

    fn app(state: &AppState) -> Router {
        create_router(state.clone())
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    async fn get_uri(state: &AppState, uri: &str) -> Response {
        app(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    /// First data frame of a live body that never ends on its own.
    async fn first_chunk(body: &mut Body) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .into_data()
            .unwrap()
    }

    async fn send_json(state: &AppState, method: &str, uri: &str, json: String) -> Response {
        app(state)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(json))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    fn add_song_file(h: &Harness, id: i64) -> ObjectRef {
        let path = h._dir.path().join(format!("{}.mp3", id));
        std::fs::write(&path, AUDIO).unwrap();
        let song = ObjectRef::new(ObjectType::Song, id);
        h.store
            .add_object(&CatalogObject {
                object: song,
                title: format!("Song {}", id),
                path: Some(path),
            })
            .unwrap();
        song
    }

    fn share_for(h: &Harness, object: ObjectRef, download: bool) -> Share {
        h.store
            .insert_share(
                &ShareDraft {
                    secret: "abc".to_string(),
                    object,
                    allow_stream: true,
                    allow_download: download,
                    expire_days: 0,
                    max_counter: 0,
                },
                unix_now(),
            )
            .unwrap()
    }

    fn fixed_channel(h: &Harness, target: ObjectRef, max_listeners: u32) -> i64 {
        let mut draft = ChannelDraft::new("Radio", target);
        draft.interface = "127.0.0.1".to_string();
        draft.port = probe::free_loopback_port().unwrap();
        draft.max_listeners = max_listeners;
        h.store.insert_channel(&draft).unwrap().id
    }

    #[tokio::test]
    async fn test_consume_stream_returns_playlist() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let playlist = seed_playlist(&h.store);
        let share = share_for(&h, playlist, false);

        let response = get_uri(
            &h.state,
            &format!("/share/consume?id={}&secret=abc", share.id),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/x-mpegurl"
        );
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains(&format!(
            "http://relay.test/play?type=song&oid=11&share_id={}&share_secret=abc",
            share.id
        )));
    }

    #[tokio::test]
    async fn test_consume_xspf_format() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let playlist = seed_playlist(&h.store);
        let share = share_for(&h, playlist, false);

        let response = get_uri(
            &h.state,
            &format!("/share/consume?id={}&secret=abc&format=xspf", share.id),
        )
        .await;
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/xspf+xml"
        );
    }

    #[tokio::test]
    async fn test_consume_denials_are_uniform() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let playlist = seed_playlist(&h.store);
        let share = share_for(&h, playlist, false);

        for uri in [
            format!("/share/consume?id={}&secret=wrong", share.id),
            format!("/share/consume?id={}&secret=abc&action=download", share.id),
            "/share/consume?id=9999&secret=abc".to_string(),
            "/share/consume?id=garbage&secret=abc".to_string(),
            format!("/share/consume?id={}&secret=abc&action=burn", share.id),
        ] {
            let response = get_uri(&h.state, &uri).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
            assert_eq!(&body_bytes(response).await[..], b"Access denied");
        }
        assert_eq!(h.store.share(share.id).unwrap().unwrap().counter, 0);
    }

    #[tokio::test]
    async fn test_consume_download_song_and_container() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let song = add_song_file(&h, 501);
        let song_share = share_for(&h, song, true);

        let response = get_uri(
            &h.state,
            &format!("/share/consume?id={}&secret=abc&action=download", song_share.id),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        assert_eq!(&body_bytes(response).await[..], AUDIO);

        let playlist = seed_playlist(&h.store);
        let container_share = share_for(&h, playlist, true);
        let response = get_uri(
            &h.state,
            &format!(
                "/share/consume?id={}&secret=abc&action=download",
                container_share.id
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://relay.test/view/playlist/1"
        );
    }

    #[tokio::test]
    async fn test_play_track_with_share_credentials() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let song = add_song_file(&h, 502);
        let share = share_for(&h, song, false);

        let ok = get_uri(
            &h.state,
            &format!(
                "/play?type=song&oid=502&share_id={}&share_secret=abc",
                share.id
            ),
        )
        .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(&body_bytes(ok).await[..], AUDIO);

        let denied = get_uri(&h.state, "/play?type=song&oid=502").await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_channel_stream_counts_listener_for_body_lifetime() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);

        let response = get_uri(&h.state, &format!("/channel/{}/stream.mp3?rt=1", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        assert_eq!(h.store.channel(id).unwrap().unwrap().runtime.listeners, 1);

        let mut body = response.into_body();
        assert!(!first_chunk(&mut body).await.is_empty());
        drop(body);
        wait_for_listeners(&h.store, id, 0).await;
        assert_eq!(h.store.channel(id).unwrap().unwrap().runtime.peak_listeners, 1);

        h.state.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_serves_concurrent_listeners() {
        let scripts = TempDir::new().unwrap();
        let h = harness(Arc::new(script_launcher(scripts.path())), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);
        let uri = format!("/channel/{}/stream.mp3", id);

        let first = get_uri(&h.state, &uri).await;
        let second = get_uri(&h.state, &uri).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);

        let (mut first, mut second) = (first.into_body(), second.into_body());
        assert!(!first_chunk(&mut first).await.is_empty());
        assert!(!first_chunk(&mut second).await.is_empty());
        let channel = h.store.channel(id).unwrap().unwrap();
        assert_eq!(channel.runtime.listeners, 2);
        assert_eq!(channel.runtime.peak_listeners, 2);

        // Both bodies keep flowing from the one encoder.
        assert!(!first_chunk(&mut first).await.is_empty());
        assert!(!first_chunk(&mut second).await.is_empty());

        h.state.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_stream_enforces_max_listeners() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 1);

        let first = get_uri(&h.state, &format!("/channel/{}/stream.mp3", id)).await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = get_uri(&h.state, &format!("/channel/{}/stream.mp3", id)).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        drop(first);
        wait_for_listeners(&h.store, id, 0).await;
        let third = get_uri(&h.state, &format!("/channel/{}/stream.mp3", id)).await;
        assert_eq!(third.status(), StatusCode::OK);

        h.state.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_stream_wrong_extension() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);

        let response = get_uri(&h.state, &format!("/channel/{}/stream.ogg", id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        h.state.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_running_channel_moves_endpoint() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);
        let before = h.state.supervisor.ensure_running(id).await.unwrap();

        let new_port = probe::free_loopback_port().unwrap();
        let draft = format!(
            r#"{{"name":"Radio","target":{{"object_type":"playlist","object_id":1}},"interface":"127.0.0.1","port":{}}}"#,
            new_port
        );
        let response = send_json(&h.state, "PUT", &format!("/admin/channels/{}", id), draft).await;
        assert_eq!(response.status(), StatusCode::OK);
        let status: ChannelStatus = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status.port, new_port);
        assert_eq!(status.state.label(), "Stopped");

        // The old encoder is gone, not orphaned behind the old port.
        assert!(!probe::pid_alive(before.runtime.pid));
        assert!(probe::port_available("127.0.0.1", before.port).is_ok());

        let stream = get_uri(&h.state, &format!("/channel/{}/stream.mp3", id)).await;
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(h.store.channel(id).unwrap().unwrap().port, new_port);
        drop(stream);
        h.state.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_is_bad_gateway_with_reason() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);
        let port = h.store.channel(id).unwrap().unwrap().port;
        let _squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        let response = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/admin/channels/{}/start", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.contains("port already in use"), "{}", text);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let id = fixed_channel(&h, target, 0);

        let response = get_uri(&h.state, &format!("/channel/{}/status.xsl", id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let status: ChannelStatus = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status.id, id);
        assert_eq!(status.state.label(), "Stopped");
        assert_eq!(status.stream_types, vec!["transcode".to_string()]);
        assert!(status
            .play_url
            .starts_with(&format!("http://relay.test/channel/{}/stream.mp3?rt=", id)));

        let missing = get_uri(&h.state, "/channel/999/status.xsl").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), Some("s3cret"));
        let draft = r#"{"name":"Radio","target":{"object_type":"album","object_id":1}}"#;

        let denied = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/channels")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(draft))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let created = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/channels")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(ADMIN_TOKEN_HEADER, "s3cret")
                    .body(Body::from(draft))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(h.store.channels().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_rejects_empty_channel_name() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let response = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/channels")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"name":"  ","target":{"object_type":"album","object_id":1}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.store.channels().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_list_hides_private() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let target = seed_playlist(&h.store);
        let mut hidden = ChannelDraft::new("Hidden", target);
        hidden.is_private = true;
        h.store.insert_channel(&hidden).unwrap();
        h.store
            .insert_channel(&ChannelDraft::new("Open", target))
            .unwrap();

        let response = get_uri(&h.state, "/channels").await;
        let list: Vec<ChannelStatus> =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "Open");
    }

    #[tokio::test]
    async fn test_admin_share_lifecycle() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let body = r#"{"secret":"xyz","object":{"object_type":"song","object_id":3},"allow_stream":true,"allow_download":false,"max_counter":2}"#;
        let created = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/shares")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let share: Share = serde_json::from_slice(&body_bytes(created).await).unwrap();
        assert_eq!(share.max_counter, 2);
        assert_eq!(share.counter, 0);

        let deleted = app(&h.state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/admin/shares/{}", share.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        assert!(h.store.share(share.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_share_secret_must_survive_continuation_urls() {
        let h = harness(Arc::new(FakeLauncher::new(FakeMode::Stream)), None);
        let playlist = seed_playlist(&h.store);
        let body = |secret: &str| {
            format!(
                r#"{{"secret":"{}","object":{{"object_type":"playlist","object_id":{}}},"allow_stream":true,"allow_download":false}}"#,
                secret, playlist.object_id
            )
        };

        for secret in ["a+b&c", "two words", "100%", "x#y"] {
            let response = send_json(&h.state, "POST", "/admin/shares", body(secret)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", secret);
        }

        let created = send_json(&h.state, "POST", "/admin/shares", body("Tok-en_9")).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let share: Share = serde_json::from_slice(&body_bytes(created).await).unwrap();

        let consumed = get_uri(
            &h.state,
            &format!("/share/consume?id={}&secret=Tok-en_9", share.id),
        )
        .await;
        assert_eq!(consumed.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(consumed).await.to_vec()).unwrap();
        let follow_up = text
            .lines()
            .find(|line| line.starts_with("http://relay.test/play?"))
            .unwrap()
            .trim_start_matches("http://relay.test");
        // The track is not on disk; anything but a denial shows the
        // credentials made it through the URL intact.
        let track = get_uri(&h.state, follow_up).await;
        assert_ne!(track.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(&PathBuf::from("/a/b.MP3")), "audio/mpeg");
        assert_eq!(content_type_for(&PathBuf::from("/a/b.flac")), "audio/flac");
        assert_eq!(
            content_type_for(&PathBuf::from("/a/b")),
            "application/octet-stream"
        );
    }
}
