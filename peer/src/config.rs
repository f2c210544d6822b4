use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use serde_derive::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerConfig {

    // Root of the local content-addressable store.
    pub cas_root: PathBuf,

    // Address to listen on for incoming peer connections.
    pub listen: SocketAddr,

    // Address other peers should dial; defaults to the bound address.
    pub advertise: Option<SocketAddr>,

    // Base URL of the tracker, e.g. "http://tracker:15003".
    pub tracker: String,

    // Origins run this stack with announcing off; the tracker discovers
    // them through its origin store instead.
    pub announce_enabled: bool,

    // Marks this process as an origin seeder in its peer context.
    pub origin: bool,

    // Deployment zone, handed to the tracker for locality ranking.
    pub zone: String,

    pub max_conns_per_torrent: usize,

    // Outstanding block requests per connection.
    pub request_pipeline: usize,

    // Fallback re-announce cadence; the tracker's interval hint wins.
    pub announce_interval_ms: u64,

    // Hard deadline for a whole-blob download.
    pub download_timeout_secs: u64,

    // Hard deadline for metainfo to come out of the origin refresh path.
    pub metainfo_timeout_secs: u64,

}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            cas_root: PathBuf::from("cas"),
            listen: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 16001),
            advertise: None,
            tracker: "http://localhost:15003".to_owned(),
            announce_enabled: true,
            origin: false,
            zone: String::new(),
            max_conns_per_torrent: 20,
            request_pipeline: 10,
            announce_interval_ms: 3_000,
            download_timeout_secs: 300,
            metainfo_timeout_secs: 60,
        }
    }
}
