#![forbid(unsafe_code)]

//! Axum backend exposing audio resolution and the on-disk audio cache.
//!
//! Clients ask `/api/player/{id}` where to get audio and receive a descriptor
//! naming the source (local cache, relay or degraded stream). The remaining
//! routes populate and inspect the cache, serve its files, and run the
//! degraded streaming paths.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use mime_guess::MimeGuess;
use podcast_tools::{
    cache::{CACHE_URL_PREFIX, FsCacheIndex},
    catalog::JsonCatalog,
    config::{DEFAULT_CONFIG_PATH, EnvConfig, RuntimeConfig, load_runtime_config},
    error::{ResolveError, ResolveResult},
    fallback::{self, STREAM_CONTENT_TYPE, SubprocessStreamer},
    relay::HttpRelay,
    resolver::{AudioDescriptor, ResolutionEngine, WarmPolicy},
    security::{ensure_not_root, is_safe_content_id},
};
use serde::Serialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal, task,
};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_NAME: &str = "Ethiopodcasts API v2 (JSON)";

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve podcast audio from the local cache, the relay or a fallback stream.")]
struct Cli {
    #[arg(long, env = "PODCAST_CONFIG", default_value = DEFAULT_CONFIG_PATH, help = "Env file with KEY=\"value\" settings")]
    config: PathBuf,
    #[arg(long, value_name = "PATH", help = "Catalog JSON written by the scraper")]
    catalog: Option<PathBuf>,
    #[arg(long = "cache-dir", value_name = "PATH", help = "Directory holding cached audio")]
    cache_dir: Option<PathBuf>,
    #[arg(long = "relay-url", value_name = "URL", help = "Base URL of the streaming relay")]
    relay_url: Option<String>,
    #[arg(long = "yt-dlp", value_name = "PATH", help = "yt-dlp binary used for fallback streaming")]
    yt_dlp: Option<PathBuf>,
    #[arg(long, help = "Port to listen on")]
    port: Option<u16>,
    #[arg(long, help = "Address to bind")]
    host: Option<String>,
}

impl Cli {
    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            catalog_path: self.catalog.clone(),
            cache_dir: self.cache_dir.clone(),
            relay_url: self.relay_url.clone(),
            yt_dlp_bin: self.yt_dlp.clone(),
            port: self.port,
            host: self.host.clone(),
            ..EnvConfig::default()
        }
    }

    /// The default path is optional; an explicitly chosen file must exist.
    fn config_required(&self) -> bool {
        self.config != Path::new(DEFAULT_CONFIG_PATH)
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<ResolutionEngine>,
    streamer: Arc<SubprocessStreamer>,
    cache_root: Arc<PathBuf>,
}

impl AppState {
    fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let cache = FsCacheIndex::open(&config.cache_dir, config.cache_extension.clone())
            .context("initializing audio cache")?;
        let cache_root = cache.root().to_path_buf();
        let relay = HttpRelay::new(
            config.relay_url.clone(),
            config.relay_health_timeout,
            config.relay_fetch_timeout,
        );
        let engine = ResolutionEngine::new(
            Arc::new(JsonCatalog::new(&config.catalog_path)),
            Arc::new(cache),
            Arc::new(relay),
            config.min_valid_bytes,
        );
        Ok(Self {
            engine: Arc::new(engine),
            streamer: Arc::new(SubprocessStreamer::new(&config.yt_dlp_bin)),
            cache_root: Arc::new(cache_root),
        })
    }

    /// Runs an engine operation on the blocking pool.
    async fn run<T, F>(&self, op: F) -> ApiResult<T>
    where
        F: FnOnce(&ResolutionEngine) -> ResolveResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|err| ResolveError::Internal(format!("task join error: {err}")))?
            .map_err(ApiError::from)
    }

    /// Watch page for `id`, preferring the URL the scraper recorded. Lookup
    /// failures only cost the preference, never the request.
    async fn watch_url(&self, id: &str) -> String {
        let lookup_id = id.to_owned();
        match self.run(move |engine| engine.lookup(&lookup_id)).await {
            Ok(record) => record
                .youtube_url
                .unwrap_or_else(|| fallback::watch_url(id)),
            Err(err) => {
                if err.status != StatusCode::NOT_FOUND {
                    warn!(id, error = %err.message, "catalog lookup failed; using default watch url");
                }
                fallback::watch_url(id)
            }
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &err {
            ResolveError::NotFound(_) => "Podcast not found".to_string(),
            ResolveError::NoSourceAvailable(_) => "No remote source available for caching".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            warn!(error = %err, "request failed");
        }
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Success envelope shared by every JSON route.
#[derive(Serialize)]
struct Envelope<T> {
    status: &'static str,
    message: String,
    data: T,
    timestamp: String,
}

fn success<T: Serialize>(data: T, message: impl Into<String>) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "success",
        message: message.into(),
        data,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[derive(Serialize)]
struct ServerInfo {
    server: &'static str,
    status: &'static str,
}

#[derive(Serialize)]
struct PlayerPayload {
    id: String,
    title: String,
    uploader: String,
    category: String,
    duration: String,
    duration_seconds: u64,
    thumbnail: String,
    streaming_url: String,
    #[serde(flatten)]
    audio: AudioDescriptor,
}

#[derive(Serialize)]
struct SourceUrls {
    content_id: String,
    embed_url: String,
    watch_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podcast_tools=info,backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    ensure_not_root("backend")?;

    let config = load_runtime_config(&cli.config, cli.config_required(), cli.overrides())
        .context("loading configuration")?;
    let state = AppState::from_config(&config)?;

    info!(catalog = %config.catalog_path.display(), "reading podcasts");
    info!(cache = %config.cache_dir.display(), min_valid_bytes = config.min_valid_bytes, "audio cache ready");
    info!(relay = %config.relay_url, "relay configured");

    let app = build_router(state);
    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing HOST {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/player/{id}", get(player))
        .route("/api/cache/{id}", get(cache_one))
        .route("/api/cache-popular", get(cache_popular))
        .route("/api/cache-status", get(cache_status))
        .route("/api/youtube-audio/{id}", get(youtube_audio))
        .route("/api/youtube-url/{id}", get(youtube_url))
        .route(&format!("{CACHE_URL_PREFIX}/{{file}}"), get(serve_cached_file))
        .fallback(not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

async fn root() -> Json<Envelope<ServerInfo>> {
    success(
        ServerInfo {
            server: SERVER_NAME,
            status: "running",
        },
        "Success",
    )
}

async fn health() -> Json<Envelope<ServerInfo>> {
    success(
        ServerInfo {
            server: SERVER_NAME,
            status: "healthy",
        },
        "Success",
    )
}

async fn player(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Envelope<PlayerPayload>>> {
    let (record, audio) = state
        .run(move |engine| {
            let record = engine.lookup(&id)?;
            let audio = engine.resolve_record(&record);
            Ok((record, audio))
        })
        .await?;

    Ok(success(
        PlayerPayload {
            thumbnail: fallback::thumbnail_url(&record.id),
            streaming_url: fallback::embed_url(&record.id),
            duration: format_duration(record.duration_seconds),
            duration_seconds: record.duration_seconds,
            id: record.id,
            title: record.display_title,
            uploader: record.uploader,
            category: record.category,
            audio,
        },
        "Success",
    ))
}

async fn cache_one(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let outcome = state.run(move |engine| engine.materialize_one(&id)).await?;
    let message = if outcome.downloaded {
        "Cached"
    } else {
        "Already cached"
    };
    Ok(success(outcome, message).into_response())
}

async fn cache_popular(State(state): State<AppState>) -> ApiResult<Response> {
    let summary = state
        .run(|engine| engine.warm_popular(&WarmPolicy::default()))
        .await?;
    let message = format!(
        "Cached {} of {} podcasts",
        summary.cached_count, summary.total_considered
    );
    Ok(success(summary, message).into_response())
}

async fn cache_status(State(state): State<AppState>) -> ApiResult<Response> {
    let status = state.run(|engine| engine.cache_status()).await?;
    Ok(success(status, "Success").into_response())
}

async fn youtube_url(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    if !is_safe_content_id(&id) {
        return Err(ApiError::not_found("Podcast not found"));
    }
    let watch_url = state.watch_url(&id).await;
    Ok(success(
        SourceUrls {
            embed_url: fallback::embed_url(&id),
            watch_url,
            content_id: id,
        },
        "Success",
    )
    .into_response())
}

/// Pipes `yt-dlp` output into the response. Failures before the first audio
/// byte still become a JSON 500; after that the body simply ends, and a
/// client disconnect drops the body, which kills the process.
async fn youtube_audio(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    if !is_safe_content_id(&id) {
        return Err(ApiError::not_found("Podcast not found"));
    }
    let source = state.watch_url(&id).await;
    let stream = state.streamer.start(&source).await.map_err(|err| {
        warn!(id, error = %format!("{err:#}"), "fallback stream failed to start");
        ApiError::internal(format!("Audio stream unavailable: {err}"))
    })?;

    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(STREAM_CONTENT_TYPE),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    Ok(response)
}

async fn serve_cached_file(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let valid = file
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| is_safe_content_id(stem) && !ext.is_empty());
    if !valid {
        return Err(ApiError::not_found("file not found"));
    }
    stream_file(state.cache_root.join(&file), &headers).await
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }
    let size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{size}"));
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            insert_header(&mut response, header::CONTENT_LENGTH, size.to_string());
            response
        }
    };

    insert_header(&mut response, header::ACCEPT_RANGES, "bytes".to_string());
    if let Some(mime) = MimeGuess::from_path(&path).first() {
        insert_header(&mut response, header::CONTENT_TYPE, mime.to_string());
    }
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = header::HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

/// Parses a single `bytes=` range. Multi-range requests are served whole.
fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    if end_str.is_empty() {
        // Open-ended; a start past EOF is left for the caller to answer 416.
        return Some((start, size.saturating_sub(1).max(start)));
    }
    let end: u64 = end_str.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end))
}

/// `m:ss`, matching what the mobile client renders.
fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
