mod backend;
mod client;
mod cluster;
mod config;
mod refresher;
mod repairer;
mod replication;
mod server;
mod upload;

pub use backend::{Backend, BackendError, FsBackend};
pub use client::{ClientError, MetaInfoStatus, OriginClient};
pub use cluster::ClusterClient;
pub use config::{OriginConfig, RepairConfig};
pub use refresher::{Refresher, RefreshStatus};
pub use repairer::ProgressRecord;
pub use server::{spawn_origin, OriginHandle, OriginState};
pub use upload::{CommitOutcome, UploadError, UploadManager};
