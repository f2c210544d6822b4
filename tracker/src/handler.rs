use std::sync::Arc;
use shoal::announce::{AnnounceRequest, AnnounceResponse, HandoutPeer};
use crate::{
    config::TrackerConfig,
    origin_store::OriginStore,
    peer_store::PeerStore,
    policy,
};

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {

    // Neither the roster nor the origin store produced anyone.
    #[error("no peers available for torrent")]
    NoPeersAvailable,
}

// Handles announce requests: roster upkeep plus the ranked handout.
pub struct AnnounceHandler {

    config: TrackerConfig,

    peer_store: Arc<PeerStore>,

    origin_store: Arc<OriginStore>,

}

impl AnnounceHandler {

    pub fn new(
        config: TrackerConfig,
        peer_store: Arc<PeerStore>,
        origin_store: Arc<OriginStore>,
    ) -> Self {
        AnnounceHandler {
            config,
            peer_store,
            origin_store,
        }
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, AnnounceError> {

        self.peer_store
            .update_peer(&request.info_hash, request.peer.clone(), request.complete);

        // Seeders need no handout.
        if request.complete {
            return Ok(AnnounceResponse {
                peers: Vec::new(),
                interval_ms: self.config.announce_interval_ms,
            });
        }

        // Roster and origin store are consulted concurrently; either
        // side may fail without dropping the other's results.
        let limit = self.config.peer_handout_limit;
        let (peers, origins) = tokio::join!(
            async {
                self.peer_store
                    .get_peers(&request.info_hash, limit, Some(request.peer.peer_id))
            },
            self.origin_store.get_origins(&request.digest),
        );

        let mut candidates = peers;
        match origins {
            Ok(origins) => candidates.extend(origins),
            Err(e) => {
                tracing::warn!("announce for {} without origins: {}", request.digest, e);
            }
        }

        if candidates.is_empty() {
            return Err(AnnounceError::NoPeersAvailable);
        }

        dedup_by_peer_id(&mut candidates);
        policy::rank(&request.peer, &mut candidates);
        candidates.truncate(limit);

        Ok(AnnounceResponse {
            peers: candidates,
            interval_ms: self.config.announce_interval_ms,
        })
    }
}

fn dedup_by_peer_id(candidates: &mut Vec<HandoutPeer>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|p| seen.insert(p.ctx.peer_id));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use shoal::{Digest, PeerContext, PeerId};
    use super::*;

    fn handler() -> AnnounceHandler {
        let config = TrackerConfig::default();
        let peer_store = Arc::new(PeerStore::new(
            Duration::from_secs(config.peer_ttl_secs),
            config.swarm_capacity,
        ));
        let origin_store = Arc::new(OriginStore::new(config.clone()));
        AnnounceHandler::new(config, peer_store, origin_store)
    }

    fn peer(port: u16) -> PeerContext {
        PeerContext {
            peer_id: PeerId::random(),
            ip: "10.0.0.9".parse().unwrap(),
            port,
            origin: false,
            zone: String::new(),
        }
    }

    fn request(digest: &Digest, peer: PeerContext, complete: bool) -> AnnounceRequest {
        AnnounceRequest {
            digest: digest.clone(),
            info_hash: "ab".repeat(10),
            peer,
            complete,
        }
    }

    #[tokio::test]
    async fn test_complete_peer_gets_empty_handout() {
        let handler = handler();
        let digest = Digest::compute(b"blob");
        // A leech is present, but seeders still get nothing back.
        handler.peer_store.update_peer(&"ab".repeat(10), peer(1), false);

        let response = handler.announce(&request(&digest, peer(2), true)).await.unwrap();
        assert!(response.peers.is_empty());
        assert_eq!(response.interval_ms, 3_000);
    }

    #[tokio::test]
    async fn test_handout_with_origins_down_keeps_peers() {
        let handler = handler();
        let digest = Digest::compute(b"blob");
        handler.origin_store.prime_locations(&digest, Err("cluster down".into()));

        let p1 = peer(1);
        handler.announce(&request(&digest, p1.clone(), false)).await.ok();
        let response = handler.announce(&request(&digest, peer(2), false)).await.unwrap();

        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].ctx.peer_id, p1.peer_id);
    }

    #[tokio::test]
    async fn test_handout_with_only_origins() {
        let handler = handler();
        let digest = Digest::compute(b"blob");
        handler.origin_store.prime_locations(&digest, Ok(vec!["o1:15002".into()]));
        handler.origin_store.prime_context("o1:15002", Ok(PeerContext {
            peer_id: PeerId::random(),
            ip: "10.1.1.1".parse().unwrap(),
            port: 16001,
            origin: true,
            zone: String::new(),
        }));

        let response = handler.announce(&request(&digest, peer(1), false)).await.unwrap();
        assert_eq!(response.peers.len(), 1);
        assert!(response.peers[0].ctx.origin);
    }

    #[tokio::test]
    async fn test_no_peers_at_all_is_an_error() {
        let handler = handler();
        let digest = Digest::compute(b"blob");
        handler.origin_store.prime_locations(&digest, Err("cluster down".into()));
        assert!(matches!(
            handler.announce(&request(&digest, peer(1), false)).await,
            Err(AnnounceError::NoPeersAvailable),
        ));
    }

    #[tokio::test]
    async fn test_origins_ranked_first_and_capped() {
        let handler = handler();
        let digest = Digest::compute(b"blob");
        handler.origin_store.prime_locations(&digest, Ok(vec!["o1:15002".into()]));
        handler.origin_store.prime_context("o1:15002", Ok(PeerContext {
            peer_id: PeerId::random(),
            ip: "10.1.1.1".parse().unwrap(),
            port: 16001,
            origin: true,
            zone: String::new(),
        }));

        let p1 = peer(1);
        let p2 = peer(2);
        handler.announce(&request(&digest, p1.clone(), false)).await.ok();
        handler.announce(&request(&digest, p2.clone(), false)).await.ok();

        let p3 = peer(3);
        let response = handler.announce(&request(&digest, p3.clone(), false)).await.unwrap();

        // P1, P2 and the origin, ranked origin-first, requester absent.
        assert_eq!(response.peers.len(), 3);
        assert!(response.peers[0].ctx.origin);
        assert!(response.peers.iter().all(|p| p.ctx.peer_id != p3.peer_id));
        assert!(response.peers.len() <= handler.config.peer_handout_limit);
    }
}
