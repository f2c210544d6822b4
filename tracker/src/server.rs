use std::{net::SocketAddr, sync::Arc, time::Duration};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_derive::Deserialize;
use tokio::task::JoinHandle;
use origin::{ClientError, MetaInfoStatus, OriginClient};
use shoal::{announce::AnnounceRequest, Digest, PeerContext, PeerId};
use crate::{
    config::TrackerConfig,
    handler::{AnnounceError, AnnounceHandler},
    origin_store::OriginStore,
    peer_store::PeerStore,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct TrackerState {

    pub config: TrackerConfig,

    pub peer_store: Arc<PeerStore>,

    pub origin_store: Arc<OriginStore>,

    pub handler: AnnounceHandler,

}

pub struct TrackerHandle {

    pub addr: SocketAddr,

    pub state: Arc<TrackerState>,

    pub task: JoinHandle<()>,

}

pub async fn spawn_tracker(
    config: TrackerConfig,
    listener: tokio::net::TcpListener,
) -> std::io::Result<TrackerHandle> {

    let peer_store = Arc::new(PeerStore::new(config.peer_ttl(), config.swarm_capacity));
    let origin_store = Arc::new(OriginStore::new(config.clone()));
    let handler = AnnounceHandler::new(config.clone(), peer_store.clone(), origin_store.clone());

    let state = Arc::new(TrackerState {
        config,
        peer_store,
        origin_store,
        handler,
    });

    // Lazy expiry covers reads; the sweep keeps idle swarms bounded.
    let sweep_store = state.peer_store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweep_store.remove_expired();
        }
    });

    let addr = listener.local_addr()?;
    let app = router(state.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("tracker server exited: {}", e);
        }
    });

    tracing::info!("tracker serving on {}", addr);
    Ok(TrackerHandle { addr, state, task })
}

pub(crate) fn router(state: Arc<TrackerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/announce", get(announce_legacy))
        .route("/announce/:infohash", post(announce))
        .route("/namespace/:ns/blobs/:digest/metainfo", get(get_metainfo))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn announce_response(
    result: Result<shoal::announce::AnnounceResponse, AnnounceError>,
) -> Response {
    match result {
        Ok(response) => Json(response).into_response(),
        Err(AnnounceError::NoPeersAvailable) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no peers available" })),
        )
            .into_response(),
    }
}

async fn announce(
    State(state): State<Arc<TrackerState>>,
    Path(infohash): Path<String>,
    Json(mut request): Json<AnnounceRequest>,
) -> Response {
    // The path is authoritative for which swarm this announce touches.
    request.info_hash = infohash;
    tracing::debug!("announce: {:?}", request);
    announce_response(state.handler.announce(&request).await)
}

// Legacy announce: everything in the query string.
#[derive(Deserialize)]
struct LegacyAnnounce {
    digest: Digest,
    info_hash: String,
    peer_id: PeerId,
    ip: std::net::IpAddr,
    port: u16,
    #[serde(default)]
    origin: bool,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    complete: bool,
}

async fn announce_legacy(
    State(state): State<Arc<TrackerState>>,
    Query(query): Query<LegacyAnnounce>,
) -> Response {
    let request = AnnounceRequest {
        digest: query.digest,
        info_hash: query.info_hash,
        peer: PeerContext {
            peer_id: query.peer_id,
            ip: query.ip,
            port: query.port,
            origin: query.origin,
            zone: query.zone,
        },
        complete: query.complete,
    };
    announce_response(state.handler.announce(&request).await)
}

// Proxy metainfo from the responsible origin, propagating its
// poll-again and not-found answers untouched.
async fn get_metainfo(
    State(state): State<Arc<TrackerState>>,
    Path((ns, digest)): Path<(String, String)>,
) -> Response {

    let digest: Digest = match digest.parse() {
        Ok(digest) => digest,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("bad digest: {}", e)).into_response();
        }
    };

    let addrs = match state.origin_store.get_locations(&digest).await {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("metainfo locations for {} failed: {}", digest, e);
            return (StatusCode::SERVICE_UNAVAILABLE, "origin cluster unavailable").into_response();
        }
    };

    for addr in addrs {
        match OriginClient::new(addr.clone()).get_metainfo(&ns, &digest).await {
            Ok(MetaInfoStatus::Ready(metainfo)) => {
                return match metainfo.to_bytes() {
                    Ok(bytes) => bytes.into_response(),
                    Err(e) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                    }
                };
            }
            Ok(MetaInfoStatus::Pending) => {
                return (StatusCode::ACCEPTED, "refreshing, retry later").into_response();
            }
            Err(ClientError::NotFound) => {
                return (StatusCode::NOT_FOUND, "not found").into_response();
            }
            Err(e) => {
                tracing::warn!("metainfo from {} failed: {}", addr, e);
            }
        }
    }

    (StatusCode::SERVICE_UNAVAILABLE, "no origin reachable").into_response()
}
