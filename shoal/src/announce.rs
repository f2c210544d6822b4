use serde_derive::{Deserialize, Serialize};
use crate::digest::Digest;
use crate::peer::PeerContext;

// JSON body of POST /announce/{infohash}.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnnounceRequest {

    pub digest: Digest,

    // Lowercase hex of the 20-byte info-hash.
    pub info_hash: String,

    pub peer: PeerContext,

    // Seeders get an empty handout back.
    pub complete: bool,

}

// One candidate in a handout, ranked best-first.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandoutPeer {

    #[serde(flatten)]
    pub ctx: PeerContext,

    pub complete: bool,

}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnnounceResponse {

    pub peers: Vec<HandoutPeer>,

    // How long the peer should wait before re-announcing.
    pub interval_ms: u64,

}

#[cfg(test)]
mod tests {
    use crate::peer::PeerId;
    use super::*;

    #[test]
    fn test_announce_json_round_trip() {
        let req = AnnounceRequest {
            digest: Digest::compute(b"blob"),
            info_hash: "aa".repeat(10),
            peer: PeerContext {
                peer_id: PeerId::random(),
                ip: "192.168.1.1".parse().unwrap(),
                port: 16001,
                origin: false,
                zone: String::new(),
            },
            complete: false,
        };
        let back: AnnounceRequest =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(back.digest, req.digest);
        assert_eq!(back.peer, req.peer);

        let resp = AnnounceResponse {
            peers: vec![HandoutPeer { ctx: req.peer.clone(), complete: true }],
            interval_ms: 3000,
        };
        let back: AnnounceResponse =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(back.peers.len(), 1);
        assert!(back.peers[0].complete);
        assert_eq!(back.interval_ms, 3000);
    }
}
