use std::net::IpAddr;
use sha2::{Digest as _, Sha256};
use shoal::{announce::HandoutPeer, PeerContext};

// Rank candidates for a requesting peer, best first: origins, then
// complete peers, then locality, with a stable pseudo-random
// tie-breaker so repeated announces converge on the same ordering.
// Pure: no state between calls.
pub fn rank(requester: &PeerContext, candidates: &mut [HandoutPeer]) {
    candidates.sort_by(|a, b| {
        score(requester, b).cmp(&score(requester, a))
    });
}

// Higher is better: (origin, complete, local, tiebreak).
fn score(requester: &PeerContext, candidate: &HandoutPeer) -> (bool, bool, bool, u64) {
    (
        candidate.ctx.origin,
        candidate.complete,
        is_local(requester, &candidate.ctx),
        tiebreak(requester, &candidate.ctx),
    )
}

// Same zone when both declare one, else a shared IPv4 /24.
fn is_local(a: &PeerContext, b: &PeerContext) -> bool {
    if !a.zone.is_empty() && !b.zone.is_empty() {
        return a.zone == b.zone;
    }
    match (a.ip, b.ip) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}

// Stable per-pair value from the xor of the two peer ids. Symmetric,
// deterministic, and uncorrelated between candidate pairs.
fn tiebreak(requester: &PeerContext, candidate: &PeerContext) -> u64 {
    let mut xored = [0u8; 20];
    for (i, out) in xored.iter_mut().enumerate() {
        *out = requester.peer_id.as_bytes()[i] ^ candidate.peer_id.as_bytes()[i];
    }
    let mut hasher = Sha256::new();
    hasher.update(xored);
    let out = hasher.finalize();
    u64::from_be_bytes(out[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use shoal::PeerId;
    use super::*;

    fn peer(ip: &str, zone: &str, origin: bool) -> PeerContext {
        PeerContext {
            peer_id: PeerId::random(),
            ip: ip.parse().unwrap(),
            port: 16001,
            origin,
            zone: zone.to_owned(),
        }
    }

    fn handout(ctx: PeerContext, complete: bool) -> HandoutPeer {
        HandoutPeer { ctx, complete }
    }

    #[test]
    fn test_origin_outranks_everything() {
        let requester = peer("10.0.0.1", "", false);
        let mut candidates = vec![
            handout(peer("10.0.0.2", "", false), true),
            handout(peer("172.16.0.9", "", true), true),
            handout(peer("10.0.0.3", "", false), false),
        ];
        rank(&requester, &mut candidates);
        assert!(candidates[0].ctx.origin);
    }

    #[test]
    fn test_complete_outranks_incomplete() {
        let requester = peer("10.0.0.1", "", false);
        let mut candidates = vec![
            handout(peer("10.9.9.9", "", false), false),
            handout(peer("172.16.0.9", "", false), true),
        ];
        rank(&requester, &mut candidates);
        assert!(candidates[0].complete);
    }

    #[test]
    fn test_subnet_locality_breaks_completeness_ties() {
        let requester = peer("10.0.0.1", "", false);
        let mut candidates = vec![
            handout(peer("172.16.0.9", "", false), true),
            handout(peer("10.0.0.77", "", false), true),
        ];
        rank(&requester, &mut candidates);
        assert_eq!(candidates[0].ctx.ip, "10.0.0.77".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_zone_wins_over_subnet_when_declared() {
        let requester = peer("10.0.0.1", "east", false);
        let mut candidates = vec![
            handout(peer("10.0.0.2", "west", false), true),
            handout(peer("192.168.5.5", "east", false), true),
        ];
        rank(&requester, &mut candidates);
        assert_eq!(candidates[0].ctx.zone, "east");
    }

    #[test]
    fn test_rank_is_deterministic() {
        let requester = peer("10.0.0.1", "", false);
        let peers: Vec<HandoutPeer> = (0..10)
            .map(|i| handout(peer(&format!("172.16.0.{}", i), "", false), false))
            .collect();

        let mut a = peers.clone();
        let mut b = peers;
        rank(&requester, &mut a);
        rank(&requester, &mut b);
        let ids = |v: &[HandoutPeer]| v.iter().map(|p| p.ctx.peer_id).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }
}
