use std::net::IpAddr;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

// 20-byte swarm identity, uniformly random per process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {

    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::Rng::fill(&mut rand::thread_rng(), &mut id[..]);
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let id: [u8; 20] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(PeerId(id))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// How a peer is reached and ranked. Origins set `origin` so trackers can
// hand them out with priority.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerContext {

    pub peer_id: PeerId,

    pub ip: IpAddr,

    pub port: u16,

    // True for origin-cluster seeders.
    #[serde(default)]
    pub origin: bool,

    // Deployment zone, used for locality ranking.
    #[serde(default)]
    pub zone: String,

}

impl PeerContext {
    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_round_trip() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_peer_id_rejects_bad_lengths() {
        assert!("abcd".parse::<PeerId>().is_err());
        assert!("zz".repeat(20).parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_context_json_round_trip() {
        let ctx = PeerContext {
            peer_id: PeerId::random(),
            ip: "10.2.3.4".parse().unwrap(),
            port: 7001,
            origin: true,
            zone: "zone1".into(),
        };
        let json = serde_json::to_string(&ctx).unwrap();
        let back: PeerContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
