use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_util::codec::Framed;
use futures::StreamExt;
use shoal::{Digest, MetaInfo, PeerContext};
use crate::{
    announce::AnnounceClient,
    archive::Archive,
    config::PeerConfig,
    conn::{Handshake, HandshakeCodec, PROTOCOL},
    torrent::{Torrent, TorrentCommand, TorrentError, TorrentHandle, TorrentParams},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type SchedulerTx = mpsc::UnboundedSender<SchedulerCommand>;
pub(crate) type SchedulerRx = mpsc::UnboundedReceiver<SchedulerCommand>;

pub(crate) enum SchedulerCommand {

    // Register (or look up) a torrent; answers with its done channel.
    AddTorrent {
        digest: Digest,
        metainfo: MetaInfo,
        resp: oneshot::Sender<Result<watch::Receiver<bool>, TorrentError>>,
    },

    RemoveTorrent { info_hash: [u8; 20] },

    // Dial a known peer for a registered torrent, bypassing announce.
    ConnectPeer { info_hash: [u8; 20], remote: PeerContext },

    // A handshaken inbound connection ready to be routed by info-hash.
    Inbound {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
        addr: SocketAddr,
    },

    Shutdown,

}

// Network lifecycle for the whole process: one listener, a torrent
// registry keyed by info-hash, and routing of accepted connections.
pub(crate) struct Scheduler {

    listener: TcpListener,

    cmd_rx: SchedulerRx,

    // Handed to handshake tasks so they can route accepted peers back.
    cmd_tx: SchedulerTx,

    torrents: HashMap<[u8; 20], TorrentHandle>,

    archive: Archive,

    config: PeerConfig,

    // The context peers and the tracker see for this process.
    local_ctx: PeerContext,

    // None disables announcing (origin seeders are discovered through
    // the tracker's origin store instead).
    announce: Option<AnnounceClient>,

}

impl Scheduler {

    pub fn spawn(
        listener: TcpListener,
        archive: Archive,
        config: PeerConfig,
        local_ctx: PeerContext,
        announce: Option<AnnounceClient>,
    ) -> (SchedulerTx, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler {
            listener,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            torrents: HashMap::new(),
            archive,
            config,
            local_ctx,
            announce,
        };
        let task = tokio::spawn(async move { scheduler.run().await });
        (cmd_tx, task)
    }

    #[tracing::instrument(skip(self), name = "scheduler", fields(peer_id = %self.local_ctx.peer_id))]
    async fn run(&mut self) {

        tracing::info!("listening for peers on {}", self.local_ctx.addr());

        loop { tokio::select! {

            conn = self.listener.accept() => {
                match conn {
                    Ok((stream, addr)) => self.spawn_handshake(stream, addr),
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            }

            Some(cmd) = self.cmd_rx.recv() => {
                match cmd {

                    SchedulerCommand::AddTorrent { digest, metainfo, resp } => {
                        resp.send(self.add_torrent(digest, metainfo)).ok();
                    }

                    SchedulerCommand::RemoveTorrent { info_hash } => {
                        self.remove_torrent(info_hash);
                    }

                    SchedulerCommand::ConnectPeer { info_hash, remote } => {
                        match self.torrents.get(&info_hash) {
                            Some(handle) => {
                                handle.torrent_tx
                                    .send(TorrentCommand::Dial { peers: vec![remote] })
                                    .ok();
                            }
                            None => tracing::warn!(
                                "connect for unknown torrent {}",
                                hex::encode(info_hash),
                            ),
                        }
                    }

                    SchedulerCommand::Inbound { socket, handshake, addr } => {
                        self.route_inbound(socket, handshake, addr);
                    }

                    SchedulerCommand::Shutdown => break,

                }
            }

        }}

        self.shutdown().await;
    }

    // Read the opening handshake off-loop so a slow peer can't stall
    // accepts; validated connections come back as Inbound commands.
    fn spawn_handshake(&self, stream: TcpStream, addr: SocketAddr) {
        let cmd_tx = self.cmd_tx.clone();
        let local_id = self.local_ctx.peer_id;
        tokio::spawn(async move {
            let mut socket = Framed::new(stream, HandshakeCodec);
            let handshake = match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Ok(Some(Ok(handshake))) => handshake,
                Ok(Some(Err(e))) => {
                    tracing::warn!("bad handshake from {}: {}", addr, e);
                    return;
                }
                Ok(None) | Err(_) => {
                    tracing::warn!("no handshake from {}", addr);
                    return;
                }
            };

            if handshake.protocol != PROTOCOL {
                tracing::warn!("wrong protocol tag from {}", addr);
                return;
            }
            if handshake.peer_id() == local_id {
                tracing::warn!("dropping connection from ourselves");
                return;
            }

            cmd_tx.send(SchedulerCommand::Inbound { socket, handshake, addr }).ok();
        });
    }

    fn route_inbound(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
        addr: SocketAddr,
    ) {
        match self.torrents.get(&handshake.info_hash) {
            Some(handle) => {
                handle.torrent_tx
                    .send(TorrentCommand::Inbound { socket, handshake, addr })
                    .ok();
            }
            None => {
                tracing::warn!(
                    "peer {} announced unknown info-hash {}",
                    addr,
                    hex::encode(handshake.info_hash),
                );
            }
        }
    }

    fn add_torrent(
        &mut self,
        digest: Digest,
        metainfo: MetaInfo,
    ) -> Result<watch::Receiver<bool>, TorrentError> {

        let info_hash = metainfo.info_hash();
        if let Some(handle) = self.torrents.get(&info_hash) {
            // AddTorrent is idempotent per info-hash.
            return Ok(handle.done_rx.clone());
        }

        let store = if self.archive.has_blob(&digest) {
            self.archive.open_seed(&digest, metainfo)?
        } else {
            self.archive.create_leech(&digest, metainfo)?
        };

        let handle = Torrent::spawn(TorrentParams {
            digest,
            store,
            local_ctx: self.local_ctx.clone(),
            announce: self.announce.clone(),
            announce_interval: Duration::from_millis(self.config.announce_interval_ms),
            max_conns: self.config.max_conns_per_torrent,
            request_pipeline: self.config.request_pipeline,
        });

        let done_rx = handle.done_rx.clone();
        self.torrents.insert(info_hash, handle);
        Ok(done_rx)
    }

    fn remove_torrent(&mut self, info_hash: [u8; 20]) {
        match self.torrents.remove(&info_hash) {
            Some(mut handle) => {
                handle.torrent_tx.send(TorrentCommand::Shutdown).ok();
                if let Some(task) = handle.task.take() {
                    // Reap off-loop; Shutdown already started the drain.
                    tokio::spawn(async move {
                        let _ = task.await;
                    });
                }
            }
            None => {
                tracing::warn!("attempted to remove unknown torrent {}", hex::encode(info_hash));
            }
        }
    }

    // Stop every torrent and wait for each to drain its connections.
    async fn shutdown(&mut self) {
        tracing::info!("scheduler shutting down {} torrents", self.torrents.len());
        for handle in self.torrents.values() {
            handle.torrent_tx.send(TorrentCommand::Shutdown).ok();
        }
        for (info_hash, mut handle) in self.torrents.drain() {
            if let Some(task) = handle.task.take() {
                if let Err(e) = task.await {
                    tracing::error!("torrent {} panicked: {}", hex::encode(info_hash), e);
                }
            }
        }
    }
}
