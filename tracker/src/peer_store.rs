use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use shoal::{announce::HandoutPeer, PeerContext, PeerId};

struct PeerEntry {

    ctx: PeerContext,

    complete: bool,

    last_announce: Instant,

}

#[derive(Default)]
struct Swarm {
    peers: HashMap<PeerId, PeerEntry>,
}

// Bounded in-memory roster of announcing peers per info-hash. Entries
// expire by TTL after their last announce; expiry is lazy on access
// plus a periodic sweep. Reads hand back a randomized subset when the
// roster is larger than the requested limit.
pub struct PeerStore {

    swarms: DashMap<String, Swarm>,

    ttl: Duration,

    // Max roster entries per info-hash.
    capacity: usize,

}

impl PeerStore {

    pub fn new(ttl: Duration, capacity: usize) -> Self {
        PeerStore {
            swarms: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn update_peer(&self, info_hash: &str, ctx: PeerContext, complete: bool) {
        let mut swarm = self.swarms.entry(info_hash.to_owned()).or_default();
        let now = Instant::now();

        if !swarm.peers.contains_key(&ctx.peer_id) && swarm.peers.len() >= self.capacity {
            // Full roster: reclaim the stalest entry for the newcomer.
            let stalest = swarm.peers
                .iter()
                .min_by_key(|(_, e)| e.last_announce)
                .map(|(id, _)| *id);
            if let Some(id) = stalest {
                swarm.peers.remove(&id);
            }
        }

        swarm.peers.insert(ctx.peer_id, PeerEntry {
            ctx,
            complete,
            last_announce: now,
        });
    }

    // Up to limit live peers for the info-hash, excluding the requester.
    pub fn get_peers(
        &self,
        info_hash: &str,
        limit: usize,
        exclude: Option<PeerId>,
    ) -> Vec<HandoutPeer> {

        let Some(mut swarm) = self.swarms.get_mut(info_hash) else {
            return Vec::new();
        };

        let ttl = self.ttl;
        let now = Instant::now();
        swarm.peers.retain(|_, e| now.duration_since(e.last_announce) < ttl);

        let mut out: Vec<HandoutPeer> = swarm.peers
            .values()
            .filter(|e| Some(e.ctx.peer_id) != exclude)
            .map(|e| HandoutPeer { ctx: e.ctx.clone(), complete: e.complete })
            .collect();

        if out.len() > limit {
            out.shuffle(&mut rand::thread_rng());
            out.truncate(limit);
        }
        out
    }

    pub fn num_peers(&self, info_hash: &str) -> usize {
        self.swarms.get(info_hash).map(|s| s.peers.len()).unwrap_or(0)
    }

    // Periodic sweep: drop expired entries and empty swarms.
    pub fn remove_expired(&self) {
        let now = Instant::now();
        self.swarms.retain(|_, swarm| {
            swarm.peers.retain(|_, e| now.duration_since(e.last_announce) < self.ttl);
            !swarm.peers.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(port: u16) -> PeerContext {
        PeerContext {
            peer_id: PeerId::random(),
            ip: "10.0.0.1".parse().unwrap(),
            port,
            origin: false,
            zone: String::new(),
        }
    }

    #[test]
    fn test_update_then_get() {
        let store = PeerStore::new(Duration::from_secs(60), 100);
        let peer = ctx(7001);
        store.update_peer("hash", peer.clone(), false);

        let peers = store.get_peers("hash", 10, None);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ctx.peer_id, peer.peer_id);
        assert!(!peers[0].complete);

        // Re-announcing as complete flips the flag, not the count.
        store.update_peer("hash", peer, true);
        let peers = store.get_peers("hash", 10, None);
        assert_eq!(peers.len(), 1);
        assert!(peers[0].complete);
    }

    #[test]
    fn test_requester_excluded() {
        let store = PeerStore::new(Duration::from_secs(60), 100);
        let a = ctx(1);
        let b = ctx(2);
        store.update_peer("hash", a.clone(), false);
        store.update_peer("hash", b.clone(), false);

        let peers = store.get_peers("hash", 10, Some(a.peer_id));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ctx.peer_id, b.peer_id);
    }

    #[test]
    fn test_limit_returns_subset() {
        let store = PeerStore::new(Duration::from_secs(60), 100);
        for i in 0..20 {
            store.update_peer("hash", ctx(i), false);
        }
        assert_eq!(store.get_peers("hash", 5, None).len(), 5);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let store = PeerStore::new(Duration::ZERO, 100);
        store.update_peer("hash", ctx(1), false);
        assert!(store.get_peers("hash", 10, None).is_empty());
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let store = PeerStore::new(Duration::from_secs(60), 2);
        let oldest = ctx(1);
        store.update_peer("hash", oldest.clone(), false);
        std::thread::sleep(Duration::from_millis(5));
        store.update_peer("hash", ctx(2), false);
        std::thread::sleep(Duration::from_millis(5));
        store.update_peer("hash", ctx(3), false);

        assert_eq!(store.num_peers("hash"), 2);
        let ids: Vec<_> = store.get_peers("hash", 10, None)
            .into_iter()
            .map(|p| p.ctx.peer_id)
            .collect();
        assert!(!ids.contains(&oldest.peer_id));
    }

    #[test]
    fn test_sweep_drops_empty_swarms() {
        let store = PeerStore::new(Duration::ZERO, 100);
        store.update_peer("hash", ctx(1), false);
        store.remove_expired();
        assert_eq!(store.num_peers("hash"), 0);
        assert!(store.swarms.is_empty());
    }

    #[test]
    fn test_swarms_are_independent() {
        let store = PeerStore::new(Duration::from_secs(60), 100);
        store.update_peer("h1", ctx(1), false);
        store.update_peer("h2", ctx(2), false);
        assert_eq!(store.get_peers("h1", 10, None).len(), 1);
        assert_eq!(store.get_peers("h2", 10, None).len(), 1);
    }
}
