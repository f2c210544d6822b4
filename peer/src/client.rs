use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
    task::JoinHandle,
    time,
};
use shoal::{store::CasStore, Digest, MetaInfo, PeerContext, PeerId};
use crate::{
    announce::{AnnounceClient, AnnounceError},
    archive::{Archive, ArchiveError},
    config::PeerConfig,
    scheduler::{Scheduler, SchedulerCommand, SchedulerTx},
    torrent::TorrentError,
};

#[derive(Debug, thiserror::Error)]
pub enum PeerClientError {

    #[error(transparent)]
    Announce(#[from] AnnounceError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    File(#[from] shoal::store::FileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("scheduler has been unexpectedly dropped")]
    SchedulerDropped,

    #[error("announcing is disabled, cannot fetch from the swarm")]
    AnnounceDisabled,

    #[error("download timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, PeerClientError>;

// The per-node swarm participant: owns the local CAS archive, the
// scheduler task, and the tracker client, and orchestrates downloads.
pub struct PeerClient {

    scheduler_tx: SchedulerTx,

    scheduler_task: JoinHandle<()>,

    archive: Archive,

    tracker: Option<AnnounceClient>,

    config: PeerConfig,

    local_ctx: PeerContext,

}

impl PeerClient {

    pub async fn start(config: PeerConfig) -> Result<PeerClient> {
        let cas = Arc::new(CasStore::new(&config.cas_root)?);
        Self::start_with(Archive::new(cas), config).await
    }

    // Start over an archive the caller already owns (origins share their
    // CAS between the blob server and the embedded seeder).
    pub async fn start_with(archive: Archive, config: PeerConfig) -> Result<PeerClient> {

        let listener = TcpListener::bind(config.listen).await?;
        let bound = listener.local_addr()?;

        // Peers must be able to dial the advertised address; an
        // unspecified bind falls back to loopback.
        let advertised = config.advertise.unwrap_or(bound);
        let ip = if advertised.ip().is_unspecified() {
            std::net::IpAddr::from([127, 0, 0, 1])
        } else {
            advertised.ip()
        };

        let local_ctx = PeerContext {
            peer_id: PeerId::random(),
            ip,
            port: bound.port(),
            origin: config.origin,
            zone: config.zone.clone(),
        };
        tracing::info!("peer {} serving on {}", local_ctx.peer_id, local_ctx.addr());

        let tracker = if config.announce_enabled {
            Some(AnnounceClient::new(config.tracker.clone()))
        } else {
            None
        };

        let (scheduler_tx, scheduler_task) = Scheduler::spawn(
            listener,
            archive.clone(),
            config.clone(),
            local_ctx.clone(),
            tracker.clone(),
        );

        Ok(PeerClient {
            scheduler_tx,
            scheduler_task,
            archive,
            tracker,
            config,
            local_ctx,
        })
    }

    pub fn local_ctx(&self) -> &PeerContext {
        &self.local_ctx
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    // Register a torrent; seeds if the blob is cached, leeches
    // otherwise. Idempotent per info-hash.
    pub async fn add_torrent(
        &self,
        digest: &Digest,
        metainfo: MetaInfo,
    ) -> Result<watch::Receiver<bool>> {
        let (resp, rx) = oneshot::channel();
        self.scheduler_tx
            .send(SchedulerCommand::AddTorrent {
                digest: digest.clone(),
                metainfo,
                resp,
            })
            .map_err(|_| PeerClientError::SchedulerDropped)?;
        Ok(rx.await.map_err(|_| PeerClientError::SchedulerDropped)??)
    }

    // Fetch a blob into the local CAS via the swarm, then keep seeding
    // it. Completes immediately for blobs already cached.
    pub async fn download(&self, namespace: &str, digest: &Digest) -> Result<()> {

        if self.archive.has_blob(digest) {
            return self.seed_cached(digest).await;
        }

        let tracker = self.tracker.as_ref().ok_or(PeerClientError::AnnounceDisabled)?;
        let metainfo = tracker
            .poll_metainfo(
                namespace,
                digest,
                Duration::from_secs(self.config.metainfo_timeout_secs),
            )
            .await?;

        let mut done_rx = self.add_torrent(digest, metainfo).await?;

        let wait = async {
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    return Err(PeerClientError::SchedulerDropped);
                }
            }
            Ok(())
        };
        time::timeout(Duration::from_secs(self.config.download_timeout_secs), wait)
            .await
            .map_err(|_| PeerClientError::Timeout)?
    }

    // Serve a blob that is already in cache.
    pub async fn seed_cached(&self, digest: &Digest) -> Result<()> {
        let metainfo = self.archive.cached_metainfo(digest)?;
        self.add_torrent(digest, metainfo).await?;
        Ok(())
    }

    // Dial a known peer directly, bypassing the tracker.
    pub fn connect_peer(&self, info_hash: [u8; 20], remote: PeerContext) {
        self.scheduler_tx
            .send(SchedulerCommand::ConnectPeer { info_hash, remote })
            .ok();
    }

    pub fn remove_torrent(&self, info_hash: [u8; 20]) {
        self.scheduler_tx
            .send(SchedulerCommand::RemoveTorrent { info_hash })
            .ok();
    }

    // Stops every torrent and waits for connections to drain.
    pub async fn shutdown(self) {
        self.scheduler_tx.send(SchedulerCommand::Shutdown).ok();
        if let Err(e) = self.scheduler_task.await {
            tracing::error!("scheduler panicked: {}", e);
        }
    }
}
