use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use serde_derive::Deserialize;
use shoal::{RingConfig, DEFAULT_PIECE_LENGTH};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepairConfig {

    // Parallel transfers per repair run.
    pub workers: usize,

    pub max_retries: u32,

    pub max_retry_delay_ms: u64,

}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_retries: 3,
            max_retry_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginConfig {

    // This origin's label in the hash ring.
    pub label: String,

    pub listen: SocketAddr,

    pub cas_root: PathBuf,

    // Root of the filesystem backend (the binary's default store).
    pub backend_root: PathBuf,

    pub ring: RingConfig,

    // Piece length used when generating metainfo.
    pub piece_length: u64,

    // Concurrent backend pulls; extra refresh requests get WorkersBusy.
    pub refresh_workers: usize,

    // Stagger unit between replica write-back schedules, so only one
    // replica usually writes a given blob to the backend.
    pub writeback_stagger_ms: u64,

    // Uploads older than this are garbage collected.
    pub upload_deadline_secs: u64,

    pub repair: RepairConfig,

    // Listen address of the embedded torrent seeder.
    pub peer_listen: SocketAddr,

    // Zone advertised in this origin's peer context.
    pub zone: String,

}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            label: "origin1".to_owned(),
            listen: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 15002),
            cas_root: PathBuf::from("cas"),
            backend_root: PathBuf::from("backend"),
            ring: RingConfig { nodes: Vec::new(), num_replica: 3 },
            piece_length: DEFAULT_PIECE_LENGTH,
            refresh_workers: 4,
            writeback_stagger_ms: 30_000,
            upload_deadline_secs: 3600,
            repair: RepairConfig::default(),
            peer_listen: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            zone: String::new(),
        }
    }
}

impl OriginConfig {

    pub fn upload_deadline(&self) -> Duration {
        Duration::from_secs(self.upload_deadline_secs)
    }

    pub fn writeback_stagger(&self) -> Duration {
        Duration::from_millis(self.writeback_stagger_ms)
    }
}
