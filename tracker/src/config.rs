use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use serde_derive::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {

    pub listen: SocketAddr,

    // Bootstrap origin addresses for location lookups.
    pub origins: Vec<String>,

    // Re-announce hint returned to peers.
    pub announce_interval_ms: u64,

    // Most peers ever returned from one announce.
    pub peer_handout_limit: usize,

    // Roster entries expire this long after their last announce.
    pub peer_ttl_secs: u64,

    // Bound on roster size per info-hash.
    pub swarm_capacity: usize,

    // Origin store TTLs; errors are cached much shorter than hits so
    // recovering origins come back quickly.
    pub locations_ttl_ms: u64,
    pub locations_error_ttl_ms: u64,
    pub origin_context_ttl_ms: u64,
    pub origin_unavailable_ttl_ms: u64,

}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 15003),
            origins: Vec::new(),
            announce_interval_ms: 3_000,
            peer_handout_limit: 50,
            peer_ttl_secs: 300,
            swarm_capacity: 10_000,
            locations_ttl_ms: 600_000,
            locations_error_ttl_ms: 30_000,
            origin_context_ttl_ms: 600_000,
            origin_unavailable_ttl_ms: 30_000,
        }
    }
}

impl TrackerConfig {

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }

    pub fn locations_ttl(&self) -> Duration {
        Duration::from_millis(self.locations_ttl_ms)
    }

    pub fn locations_error_ttl(&self) -> Duration {
        Duration::from_millis(self.locations_error_ttl_ms)
    }

    pub fn origin_context_ttl(&self) -> Duration {
        Duration::from_millis(self.origin_context_ttl_ms)
    }

    pub fn origin_unavailable_ttl(&self) -> Duration {
        Duration::from_millis(self.origin_unavailable_ttl_ms)
    }
}
