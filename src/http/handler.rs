//! Main axum router and HTTP request handlers for the mirror cache.
//!
//! Routes:
//! - `GET  /{owner}/{repo}/info/refs`       - Smart HTTP info/refs (upload-pack only)
//! - `POST /{owner}/{repo}/git-upload-pack`  - Pack negotiation / data transfer
//! - `POST /{owner}/{repo}/git-receive-pack` - Always rejected (403)
//! - `GET  /api/db/data`                     - Every mirror state record
//! - `GET  /api/db/sum`                      - Every usage counter record
//! - `GET  /healthz`                         - Health check
//! - `GET  /metrics`                         - Prometheus metrics

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{ErrorKind, MirrorError};
use crate::git;
use crate::store::{InvalidKey, RepoKey};
use crate::AppState;

const UPLOAD_PACK: &str = "git-upload-pack";

/// Largest upload-pack negotiation accepted after gzip inflation.
const MAX_INFLATED_BODY: u64 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Git smart HTTP protocol endpoints
        .route("/{owner}/{repo}/info/refs", get(handle_info_refs))
        .route("/{owner}/{repo}/git-upload-pack", post(handle_upload_pack))
        .route(
            "/{owner}/{repo}/git-receive-pack",
            post(handle_receive_pack),
        )
        // Metadata listings
        .route("/api/db/data", get(handle_list_states))
        .route("/api/db/sum", get(handle_list_counters))
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{owner}/{repo}/info/refs?service=git-upload-pack`
///
/// Counts the request, makes sure a current mirror exists and answers with
/// the mirror's reference advertisement.
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, AppError> {
    let service = query.service.unwrap_or_default();
    if service == "git-receive-pack" {
        return Ok(push_rejected());
    }
    if service != UPLOAD_PACK {
        warn!(%service, "rejected non smart-HTTP info/refs request");
        return Ok((
            StatusCode::FORBIDDEN,
            "Invalid service, only smart HTTP git-upload-pack is supported\n",
        )
            .into_response());
    }

    let key = repo_key(&owner, &repo)?;

    if let Err(e) = state.cache.record_request(&key).await {
        warn!(error = %e, "failed to record request");
    }

    let repo_path = ensure_mirror(&state, &key).await?;
    let advert = git::git_advertise_refs(&repo_path).await?;

    let mut body = BytesMut::with_capacity(advert.len() + 64);
    put_pkt_line(&mut body, &format!("# service={UPLOAD_PACK}\n"));
    body.put_slice(b"0000");
    body.put_slice(&advert);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body.freeze(),
    )
        .into_response())
}

/// `POST /{owner}/{repo}/git-upload-pack`
///
/// Runs a local `git upload-pack` against the mirror and streams its output
/// as the response body.  Gzip-encoded request bodies are inflated first.
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let key = repo_key(&owner, &repo)?;

    let repo_path = state.layout.repo_path(&key);
    let repo_path = if git::validate_bare_repo(&repo_path).await {
        repo_path
    } else {
        // The client skipped info/refs or the mirror was replaced since.
        debug!("mirror not present for upload-pack, ensuring");
        ensure_mirror(&state, &key).await?
    };

    let input = if is_gzip(&headers) {
        inflate(&body, MAX_INFLATED_BODY)?
    } else {
        body.to_vec()
    };

    let mut child = git::git_upload_pack_streamed(&repo_path)?;
    let stdout = child
        .stdout
        .take()
        .context("failed to capture git upload-pack stdout")?;

    // Feed stdin and reap the child in the background so a large
    // negotiation cannot deadlock against an unread stdout.
    tokio::spawn(async move {
        if let Err(e) = git::write_upload_pack_input(&mut child, &input).await {
            warn!(error = %e, "failed to feed git upload-pack");
        }
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "git upload-pack exited with non-zero status");
            }
            Err(e) => {
                error!(error = %e, "failed to wait on git upload-pack");
            }
            _ => {}
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReaderStream::new(stdout)),
    )
        .into_response())
}

/// `POST /{owner}/{repo}/git-receive-pack`
///
/// Pushes are unconditionally rejected.  The cache is read-only.
#[instrument]
async fn handle_receive_pack(Path((owner, repo)): Path<(String, String)>) -> Response {
    warn!(%owner, %repo, "rejected git-receive-pack (push)");
    push_rejected()
}

/// `GET /api/db/data`
async fn handle_list_states(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let states = state.cache.list_mirror_states().await?;
    Ok(Json(states).into_response())
}

/// `GET /api/db/sum`
async fn handle_list_counters(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let counters = state.cache.list_usage_counters().await?;
    Ok(Json(counters).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        store: state.cache.store().clone(),
        layout: state.layout.clone(),
        metrics: Arc::clone(&state.metrics.metrics),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the cache.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Build the key for a path, tolerating a trailing `.git` on the repo name.
fn repo_key(owner: &str, repo: &str) -> Result<RepoKey, AppError> {
    let name = repo.strip_suffix(".git").unwrap_or(repo);
    Ok(RepoKey::new(owner, name)?)
}

async fn ensure_mirror(state: &AppState, key: &RepoKey) -> Result<PathBuf, AppError> {
    let url = state.config.upstream.repo_url(key.owner(), key.name());
    let dest = state.layout.repo_path(key);
    let cache = &state.config.cache;

    let outcome = state
        .cache
        .ensure_mirror(key, &url, &dest, cache.fresh_ttl(), cache.stale_ttl())
        .await?;

    info!(outcome = outcome.as_str(), "mirror ready");
    Ok(dest)
}

fn push_rejected() -> Response {
    (
        StatusCode::FORBIDDEN,
        "Push (git-receive-pack) is not supported by the mirror cache.\n",
    )
        .into_response()
}

/// Append `line` as a pkt-line: four hex digits of total length, then data.
fn put_pkt_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(format!("{:04x}", line.len() + 4).as_bytes());
    buf.put_slice(line.as_bytes());
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

fn inflate(body: &[u8], limit: u64) -> Result<Vec<u8>, AppError> {
    let mut out = Vec::with_capacity(body.len() * 4);
    flate2::read::GzDecoder::new(body)
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| AppError::BadRequest(format!("invalid gzip request body: {e}")))?;
    if out.len() as u64 > limit {
        return Err(AppError::PayloadTooLarge(format!(
            "gzip request body inflates past {limit} bytes"
        )));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The owner or repository segment is not a valid key.
    InvalidKey(InvalidKey),
    /// The request body could not be decoded.
    BadRequest(String),
    /// The decoded request body exceeds the accepted size.
    PayloadTooLarge(String),
    /// Mirror orchestration failed.
    Mirror(MirrorError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::InvalidKey(err) => (StatusCode::BAD_REQUEST, format!("{err}\n")).into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            AppError::Mirror(err) => {
                let status = match err.kind() {
                    ErrorKind::NoDefaultRef => StatusCode::NOT_FOUND,
                    ErrorKind::RemoteUnreachable | ErrorKind::MaterializeFailed => {
                        StatusCode::BAD_GATEWAY
                    }
                    ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    ErrorKind::StoreUnavailable | ErrorKind::InvalidLocalMirror => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status == StatusCode::NOT_FOUND {
                    debug!(error = %err, "repository not found upstream");
                } else {
                    error!(error = %err, kind = %err.kind(), "mirror unavailable");
                }
                (status, format!("{err}\n")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<InvalidKey> for AppError {
    fn from(err: InvalidKey) -> Self {
        AppError::InvalidKey(err)
    }
}

impl From<MirrorError> for AppError {
    fn from(err: MirrorError) -> Self {
        AppError::Mirror(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
