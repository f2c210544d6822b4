use std::{io::Read, net::SocketAddr, sync::Arc, time::Duration};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, head, patch, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde_derive::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use peer::{Archive, PeerClient, PeerClientError, PeerConfig};
use shoal::{
    store::{CasStore, FileError},
    Digest, HashRing,
};
use crate::{
    backend::{Backend, BackendError},
    client::OriginClient,
    config::OriginConfig,
    refresher::{RefreshEventRx, RefreshStatus, Refresher},
    repairer::{ProgressRecord, Repairer},
    replication,
    upload::{CommitOutcome, UploadError, UploadManager},
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Peer(#[from] PeerClientError),
}

// Everything a request handler can reach. One per origin process.
pub struct OriginState {

    pub config: OriginConfig,

    pub cas: Arc<CasStore>,

    pub ring: HashRing,

    pub backend: Arc<dyn Backend>,

    pub uploads: UploadManager,

    pub refresher: Refresher,

    // Embedded torrent seeder; announces are off, the tracker finds us
    // through its origin store.
    pub seeder: PeerClient,

}

pub struct OriginHandle {

    pub addr: SocketAddr,

    pub state: Arc<OriginState>,

    pub task: JoinHandle<()>,

}

// Build the full origin: CAS, refresher, embedded seeder, HTTP server.
// The listener is taken pre-bound so clusters can be wired up with
// ephemeral ports.
pub async fn spawn_origin(
    config: OriginConfig,
    backend: Arc<dyn Backend>,
    listener: tokio::net::TcpListener,
) -> Result<OriginHandle, ServerError> {

    let cas = Arc::new(CasStore::new(&config.cas_root)?);
    let uploads = UploadManager::new(cas.clone(), config.piece_length);
    let ring = HashRing::new(config.ring.clone());

    let seeder = PeerClient::start_with(
        Archive::new(cas.clone()),
        PeerConfig {
            listen: config.peer_listen,
            announce_enabled: false,
            origin: true,
            zone: config.zone.clone(),
            ..PeerConfig::default()
        },
    )
    .await?;

    let (refresher, refresh_events) =
        Refresher::new(cas.clone(), backend.clone(), uploads.clone(), config.refresh_workers);

    let state = Arc::new(OriginState {
        config,
        cas,
        ring,
        backend,
        uploads,
        refresher,
        seeder,
    });

    spawn_refresh_consumer(state.clone(), refresh_events);
    spawn_upload_sweeper(state.clone());

    let addr = listener.local_addr()?;
    let app = router(state.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("origin server exited: {}", e);
        }
    });

    tracing::info!("origin {} serving on {}", state.config.label, addr);
    Ok(OriginHandle { addr, state, task })
}

// Refreshed blobs get replicated to co-owners and seeded, the same
// post-commit path uploads take (minus the backend write-back).
fn spawn_refresh_consumer(state: Arc<OriginState>, mut events: RefreshEventRx) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            ensure_seeding(&state, &event.digest).await;
            replication::replicate_to_replicas(
                state.clone(),
                event.namespace,
                event.digest,
                false,
            );
        }
    });
}

fn spawn_upload_sweeper(state: Arc<OriginState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            match state.cas.purge_abandoned_uploads(state.config.upload_deadline()) {
                Ok(0) => {}
                Ok(n) => tracing::info!("collected {} abandoned uploads", n),
                Err(e) => tracing::error!("upload sweep failed: {}", e),
            }
        }
    });
}

pub(crate) fn router(state: Arc<OriginState>) -> Router {
    Router::new()
        // Public surface.
        .route("/health", get(health))
        .route("/blobs/:digest/locations", get(get_locations))
        .route("/namespace/:ns/blobs/:digest", get(get_blob))
        .route("/namespace/:ns/blobs/:digest/uploads", post(start_upload))
        .route(
            "/namespace/:ns/blobs/:digest/uploads/:uid",
            patch(patch_upload).put(commit_upload),
        )
        .route("/namespace/:ns/blobs/:digest/remote/:dns", post(replicate_remote))
        // Internal surface, origin to origin and tracker to origin.
        .route("/internal/blobs/:digest/uploads", post(start_transfer))
        .route(
            "/internal/blobs/:digest/uploads/:uid",
            patch(patch_transfer).put(commit_transfer),
        )
        .route("/internal/blobs/:digest", delete(delete_blob))
        .route("/internal/blobs/:digest/metainfo", post(overwrite_metainfo))
        .route("/internal/peercontext", get(peer_context))
        .route("/internal/namespace/:ns/blobs/:digest", head(head_blob))
        .route("/internal/namespace/:ns/blobs/:digest/metainfo", get(get_metainfo))
        .route(
            "/internal/duplicate/namespace/:ns/blobs/:digest/uploads/:uid",
            put(duplicate_writeback),
        )
        .route("/internal/repair", post(repair_all))
        .route("/internal/repair/shard/:shard", post(repair_shard))
        .route("/internal/repair/digest/:digest", post(repair_digest))
        .with_state(state)
}

// Wire-level outcome kinds, mapped onto the normative status codes.
pub(crate) enum ApiError {
    NotFound,
    Conflict,
    Accepted,
    WorkersBusy,
    Redirect(Vec<String>),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Conflict => (StatusCode::CONFLICT, "already exists").into_response(),
            ApiError::Accepted => (StatusCode::ACCEPTED, "retry later").into_response(),
            ApiError::WorkersBusy => {
                (StatusCode::SERVICE_UNAVAILABLE, "workers busy").into_response()
            }
            ApiError::Redirect(addrs) => (
                StatusCode::TEMPORARY_REDIRECT,
                [("Origin-Locations", addrs.join(","))],
                "not an owning origin",
            )
                .into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

impl From<FileError> for ApiError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound => ApiError::NotFound,
            FileError::Exists => ApiError::Conflict,
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Conflict => ApiError::Conflict,
            UploadError::InvalidRange(msg) => ApiError::BadRequest(msg),
            // A digest mismatch is the uploader's fault, not ours.
            UploadError::Corrupt { .. } => ApiError::BadRequest(e.to_string()),
            UploadError::File(e) => e.into(),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_digest(raw: &str) -> ApiResult<Digest> {
    raw.parse().map_err(|e: shoal::DigestError| ApiError::BadRequest(e.to_string()))
}

// Routing discipline: digest-addressed requests only run on owners.
// Public callers get a 307 with the owner list; internal callers made
// a programming error and get a 400.
fn ensure_owner(state: &OriginState, digest: &Digest, public: bool) -> ApiResult<()> {
    if state.ring.owns(&state.config.label, digest) {
        return Ok(());
    }
    if public {
        Err(ApiError::Redirect(state.ring.locations(digest)))
    } else {
        Err(ApiError::BadRequest(format!(
            "origin {} does not own {}",
            state.config.label, digest,
        )))
    }
}

fn refresh_to_api(status: RefreshStatus) -> ApiError {
    match status {
        RefreshStatus::Started | RefreshStatus::Pending => ApiError::Accepted,
        RefreshStatus::WorkersBusy => ApiError::WorkersBusy,
        RefreshStatus::NotFound => ApiError::NotFound,
        RefreshStatus::Failed(msg) => ApiError::Internal(msg),
    }
}

fn read_cache_bytes(state: &OriginState, digest: &Digest) -> Result<Vec<u8>, FileError> {
    let mut file = state.cas.get_cache(digest)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

async fn ensure_seeding(state: &Arc<OriginState>, digest: &Digest) {
    if let Err(e) = state.seeder.seed_cached(digest).await {
        tracing::warn!("seeding {} failed: {}", digest, e);
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn get_locations(
    State(state): State<Arc<OriginState>>,
    Path(digest): Path<String>,
) -> ApiResult<Response> {
    let digest = parse_digest(&digest)?;
    let locations = state.ring.locations(&digest).join(",");
    Ok(([("Origin-Locations", locations)], StatusCode::OK).into_response())
}

async fn get_blob(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest)): Path<(String, String)>,
) -> ApiResult<Response> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, true)?;

    match read_cache_bytes(&state, &digest) {
        Ok(bytes) => Ok(bytes.into_response()),
        Err(FileError::NotFound) => {
            Err(refresh_to_api(state.refresher.refresh(&ns, &digest).await))
        }
        Err(e) => Err(e.into()),
    }
}

async fn start_upload(
    State(state): State<Arc<OriginState>>,
    Path((_ns, digest)): Path<(String, String)>,
) -> ApiResult<Response> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, true)?;
    let uid = state.uploads.start(&digest)?;
    Ok(([("Location", uid)], StatusCode::OK).into_response())
}

async fn patch_upload(
    State(state): State<Arc<OriginState>>,
    Path((_ns, _digest, uid)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let range = headers
        .get("Content-Range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Content-Range".to_owned()))?;
    state.uploads.patch(&uid, range, &body)?;
    Ok(StatusCode::OK)
}

// Public commit: verify, seal, persist, write back, replicate.
async fn commit_upload(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest, uid)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, true)?;

    let outcome = state.uploads.commit(&digest, &uid)?;
    if outcome == CommitOutcome::Sealed {
        state.uploads.mark_persist(&digest)?;
        // Stagger slot zero is ours; co-owners get later slots with
        // their transfer.
        replication::schedule_writeback(
            state.clone(),
            ns.clone(),
            digest.clone(),
            Duration::ZERO,
        );
        replication::replicate_to_replicas(state.clone(), ns, digest.clone(), true);
    }
    ensure_seeding(&state, &digest).await;
    Ok(StatusCode::OK)
}

// Push a cached blob into a foreign cluster by DNS name.
async fn replicate_remote(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest, dns)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    let data = read_cache_bytes(&state, &digest).map_err(ApiError::from)?;
    OriginClient::new(dns.clone())
        .push_blob(&ns, &digest, &data)
        .await
        .map_err(|e| ApiError::Internal(format!("push to {} failed: {}", dns, e)))?;
    Ok(StatusCode::OK)
}

// Internal transfer triad: replication and repair traffic. Same upload
// protocol, no persist flag and no backend write-back.
async fn start_transfer(
    State(state): State<Arc<OriginState>>,
    Path(digest): Path<String>,
) -> ApiResult<Response> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;
    let uid = state.uploads.start(&digest)?;
    Ok(([("Location", uid)], StatusCode::OK).into_response())
}

async fn patch_transfer(
    State(state): State<Arc<OriginState>>,
    Path((_digest, uid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let range = headers
        .get("Content-Range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Content-Range".to_owned()))?;
    state.uploads.patch(&uid, range, &body)?;
    Ok(StatusCode::OK)
}

async fn commit_transfer(
    State(state): State<Arc<OriginState>>,
    Path((digest, uid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;
    state.uploads.commit(&digest, &uid)?;
    ensure_seeding(&state, &digest).await;
    Ok(StatusCode::OK)
}

async fn delete_blob(
    State(state): State<Arc<OriginState>>,
    Path(digest): Path<String>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;
    state.cas.delete_cache(&digest)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct OverwriteParams {
    piece_length: u64,
}

// Regenerate metainfo with a chosen piece length (benchmarking and
// rebalancing); answers with the new serialized metainfo.
async fn overwrite_metainfo(
    State(state): State<Arc<OriginState>>,
    Path(digest): Path<String>,
    Query(params): Query<OverwriteParams>,
) -> ApiResult<Vec<u8>> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;
    let metainfo = state.uploads.regenerate_metainfo(&digest, params.piece_length)?;
    let bytes = metainfo
        .to_bytes()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(bytes)
}

async fn peer_context(State(state): State<Arc<OriginState>>) -> Response {
    Json(state.seeder.local_ctx().clone()).into_response()
}

async fn head_blob(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;

    if state.cas.has_cache(&digest) {
        return Ok(StatusCode::OK);
    }
    match state.backend.stat(&ns, &digest).await {
        Ok(_) => Ok(StatusCode::OK),
        Err(BackendError::NotFound) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

async fn get_metainfo(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest)): Path<(String, String)>,
) -> ApiResult<Vec<u8>> {
    let digest = parse_digest(&digest)?;
    ensure_owner(&state, &digest, false)?;

    if state.cas.has_cache(&digest) {
        let metainfo = state
            .uploads
            .ensure_metainfo(&digest)
            .map_err(ApiError::from)?;
        // Anyone asking for metainfo is about to join the swarm.
        ensure_seeding(&state, &digest).await;
        return metainfo.to_bytes().map_err(|e| ApiError::Internal(e.to_string()));
    }

    Err(refresh_to_api(state.refresher.refresh(&ns, &digest).await))
}

#[derive(Deserialize)]
struct DuplicateBody {
    delay_ms: u64,
}

// A co-owner replica handed us a delayed write-back slot.
async fn duplicate_writeback(
    State(state): State<Arc<OriginState>>,
    Path((ns, digest, uid)): Path<(String, String, String)>,
    Json(body): Json<DuplicateBody>,
) -> ApiResult<StatusCode> {
    let digest = parse_digest(&digest)?;
    tracing::debug!(
        "scheduling duplicate write-back of {} (upload {}) in {}ms",
        digest,
        uid,
        body.delay_ms,
    );
    replication::schedule_writeback(
        state.clone(),
        ns,
        digest,
        Duration::from_millis(body.delay_ms),
    );
    Ok(StatusCode::OK)
}

enum RepairTarget {
    All,
    Shard(String),
    Digest(Digest),
}

// Repairs stream one JSON record per operation as they complete.
fn repair_stream(state: Arc<OriginState>, target: RepairTarget) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<ProgressRecord>();

    tokio::spawn(async move {
        let repairer = Repairer::new(state, tx);
        match target {
            RepairTarget::All => repairer.repair_all().await,
            RepairTarget::Shard(shard) => repairer.repair_shard(&shard).await,
            RepairTarget::Digest(digest) => repairer.repair_digest(&digest).await,
        }
    });

    let lines = UnboundedReceiverStream::new(rx).map(|record| {
        let mut line = serde_json::to_string(&record).unwrap_or_else(|e| {
            format!("{{\"error\":\"unserializable record: {}\"}}", e)
        });
        line.push('\n');
        Ok::<_, std::convert::Infallible>(Bytes::from(line))
    });
    Body::from_stream(lines).into_response()
}

async fn repair_all(State(state): State<Arc<OriginState>>) -> Response {
    repair_stream(state, RepairTarget::All)
}

async fn repair_shard(
    State(state): State<Arc<OriginState>>,
    Path(shard): Path<String>,
) -> ApiResult<Response> {
    if shard.len() != shoal::SHARD_PREFIX_LEN || !shard.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ApiError::BadRequest(format!("invalid shard id {}", shard)));
    }
    Ok(repair_stream(state, RepairTarget::Shard(shard)))
}

async fn repair_digest(
    State(state): State<Arc<OriginState>>,
    Path(digest): Path<String>,
) -> ApiResult<Response> {
    let digest = parse_digest(&digest)?;
    Ok(repair_stream(state, RepairTarget::Digest(digest)))
}
