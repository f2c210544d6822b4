mod config;
mod handler;
mod origin_store;
mod peer_store;
mod policy;
mod server;

pub use config::TrackerConfig;
pub use handler::{AnnounceError, AnnounceHandler};
pub use origin_store::{OriginStore, OriginStoreError};
pub use peer_store::PeerStore;
pub use server::{spawn_tracker, TrackerHandle, TrackerState};
