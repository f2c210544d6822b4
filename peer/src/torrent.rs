use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::{mpsc, watch, RwLock}, time};
use tokio_util::codec::Framed;
use shoal::{announce::AnnounceRequest, Digest, PeerContext, PeerId};
use crate::{
    announce::{AnnounceClient, AnnounceError},
    archive::{ArchiveError, TorrentStore},
    conn::{ConnCommand, ConnHandle, Handshake, HandshakeCodec, PeerSession},
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("announce error: {0}")]
    Announce(#[from] AnnounceError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub(crate) type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub(crate) type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

pub(crate) enum TorrentCommand {

    // An accepted connection routed here by the scheduler.
    Inbound {
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
        addr: SocketAddr,
    },

    // Connect out to known peers (announce handouts or direct adds).
    Dial { peers: Vec<PeerContext> },

    // Sent by a session after a piece was verified and written.
    PieceWritten { idx: u32 },

    // Sent when a session task finishes.
    ConnClosed { peer_id: PeerId },

    Shutdown,

}

// Completion and in-flight assignment per piece. Pieces are assigned to
// one connection at a time; duplicate requests to the same peer for the
// same piece are therefore suppressed by construction.
pub(crate) struct PieceTable {

    have: Bitfield,

    assigned: Vec<Option<PeerId>>,

    num_complete: u32,

}

impl PieceTable {

    fn new(num_pieces: u32, complete: bool) -> Self {
        PieceTable {
            have: Bitfield::repeat(complete, num_pieces as usize),
            assigned: vec![None; num_pieces as usize],
            num_complete: if complete { num_pieces } else { 0 },
        }
    }

    pub fn bitfield(&self) -> Bitfield {
        self.have.clone()
    }

    pub fn has(&self, idx: u32) -> bool {
        self.have[idx as usize]
    }

    pub fn is_complete(&self) -> bool {
        self.num_complete as usize == self.have.len()
    }

    pub fn num_missing(&self) -> u32 {
        self.have.len() as u32 - self.num_complete
    }

    // Highest-index missing piece the peer has and nobody is fetching.
    fn pick(&mut self, peer_bf: &Bitfield, peer: PeerId) -> Option<u32> {
        for idx in (0..self.have.len()).rev() {
            if !self.have[idx] && self.assigned[idx].is_none() && peer_bf[idx] {
                self.assigned[idx] = Some(peer);
                return Some(idx as u32);
            }
        }
        None
    }

    fn release(&mut self, idx: u32, peer: PeerId) {
        if self.assigned[idx as usize] == Some(peer) {
            self.assigned[idx as usize] = None;
        }
    }

    fn release_all(&mut self, peer: PeerId) {
        for slot in self.assigned.iter_mut() {
            if *slot == Some(peer) {
                *slot = None;
            }
        }
    }

    // Returns false if the piece was already complete.
    fn mark_complete(&mut self, idx: u32) -> bool {
        if self.have[idx as usize] {
            return false;
        }
        self.have.set(idx as usize, true);
        self.assigned[idx as usize] = None;
        self.num_complete += 1;
        true
    }
}

// Read-only state shared with every session of one torrent.
pub(crate) struct TorrentContext {

    pub info_hash: [u8; 20],

    pub local_id: PeerId,

    pub store: Arc<TorrentStore>,

    pub piece_hashes: Vec<[u8; 20]>,

    pub pieces: RwLock<PieceTable>,

    pub torrent_tx: TorrentTx,

    // Outstanding block requests per connection.
    pub request_pipeline: usize,

}

impl TorrentContext {

    pub async fn bitfield(&self) -> Bitfield {
        self.pieces.read().await.bitfield()
    }

    pub async fn has_piece(&self, idx: u32) -> bool {
        self.pieces.read().await.has(idx)
    }

    pub async fn is_complete(&self) -> bool {
        self.pieces.read().await.is_complete()
    }

    pub async fn pick_piece(&self, peer_bf: &Bitfield, peer: PeerId) -> Option<u32> {
        self.pieces.write().await.pick(peer_bf, peer)
    }

    pub async fn release_piece(&self, idx: u32, peer: PeerId) {
        self.pieces.write().await.release(idx, peer);
    }

    pub async fn release_all(&self, peer: PeerId) {
        self.pieces.write().await.release_all(peer);
    }

    // Mark idx complete. The caller must have written and verified the
    // piece first, so no peer can see a Have for an unreadable piece.
    pub async fn complete_piece(&self, idx: u32) -> bool {
        self.pieces.write().await.mark_complete(idx)
    }
}

pub(crate) struct TorrentParams {

    pub digest: Digest,

    pub store: Arc<TorrentStore>,

    pub local_ctx: PeerContext,

    // None disables announcing (origin-side seeding).
    pub announce: Option<AnnounceClient>,

    pub announce_interval: Duration,

    pub max_conns: usize,

    pub request_pipeline: usize,

}

// Per-infohash authority over pieces and connections. Runs as a task;
// sessions and the scheduler talk to it through its channel.
pub(crate) struct Torrent {

    ctx: Arc<TorrentContext>,

    digest: Digest,

    local_ctx: PeerContext,

    conns: HashMap<PeerId, ConnHandle>,

    torrent_rx: TorrentRx,

    announce: Option<AnnounceClient>,

    announce_interval: Duration,

    max_conns: usize,

    // Closed-over by wait_complete callers.
    done_tx: watch::Sender<bool>,

}

pub(crate) struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    pub done_rx: watch::Receiver<bool>,

    pub task: Option<tokio::task::JoinHandle<()>>,

}

impl Torrent {

    pub fn spawn(params: TorrentParams) -> TorrentHandle {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let metainfo = params.store.metainfo().clone();
        let complete = params.store.is_seed();
        let (done_tx, done_rx) = watch::channel(complete);

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            local_id: params.local_ctx.peer_id,
            piece_hashes: metainfo.piece_hashes(),
            pieces: RwLock::new(PieceTable::new(metainfo.num_pieces(), complete)),
            store: params.store,
            torrent_tx: torrent_tx.clone(),
            request_pipeline: params.request_pipeline,
        });

        let mut torrent = Torrent {
            ctx,
            digest: params.digest,
            local_ctx: params.local_ctx,
            conns: HashMap::new(),
            torrent_rx,
            announce: params.announce,
            announce_interval: params.announce_interval,
            max_conns: params.max_conns,
            done_tx,
        };

        let task = tokio::spawn(async move {
            torrent.run().await;
        });

        TorrentHandle {
            torrent_tx,
            done_rx,
            task: Some(task),
        }
    }

    #[tracing::instrument(skip(self), name = "torrent", fields(digest = %self.digest))]
    async fn run(&mut self) {

        // Zero-piece blobs have nothing to fetch; seal straight away so
        // the done channel and the cache agree.
        if self.ctx.is_complete().await && !*self.done_tx.borrow() {
            if let Err(e) = self.ctx.store.seal() {
                tracing::error!("sealing empty blob failed: {}", e);
            } else {
                self.done_tx.send(true).ok();
            }
        }

        self.announce_and_dial().await;
        let announce_sleep = time::sleep(self.announce_interval);
        tokio::pin!(announce_sleep);

        loop { tokio::select! {

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    TorrentCommand::Inbound { socket, handshake, addr } => {
                        self.accept_inbound(socket, handshake, addr).await;
                    },

                    TorrentCommand::Dial { peers } => {
                        for remote in peers {
                            if self.conns.len() >= self.max_conns
                                || remote.peer_id == self.ctx.local_id
                                || self.conns.contains_key(&remote.peer_id)
                            {
                                continue;
                            }
                            self.dial(remote);
                        }
                    },

                    TorrentCommand::PieceWritten { idx } => {
                        self.handle_piece_written(idx).await;
                    },

                    TorrentCommand::ConnClosed { peer_id } => {
                        self.conns.remove(&peer_id);
                        self.ctx.release_all(peer_id).await;
                    },

                    TorrentCommand::Shutdown => break,

                }
            }

            () = &mut announce_sleep => {
                self.announce_and_dial().await;
                announce_sleep.as_mut().reset(time::Instant::now() + self.announce_interval);
            }

        }}

        self.shutdown().await;
    }

    // Refresh our presence with the tracker; dial anything new it hands
    // out. Announce failures are logged and retried next interval.
    async fn announce_and_dial(&mut self) {

        let Some(announce) = self.announce.clone() else {
            // Quiet seeders (origins) are handed out by the tracker's
            // origin store instead of announcing.
            return;
        };

        let complete = self.ctx.is_complete().await;
        let request = AnnounceRequest {
            digest: self.digest.clone(),
            info_hash: hex::encode(self.ctx.info_hash),
            peer: self.local_ctx.clone(),
            complete,
        };

        let response = match announce.announce(&request).await {
            Ok(response) => response,
            Err(AnnounceError::NoPeers) if !complete => {
                tracing::debug!("tracker has no peers for us yet");
                return;
            }
            Err(e) => {
                tracing::error!("tracker announce error: {}", e);
                return;
            }
        };

        if response.interval_ms > 0 {
            self.announce_interval = Duration::from_millis(response.interval_ms);
        }
        if complete {
            // Seeders get an empty handout; nothing to dial.
            return;
        }

        for peer in response.peers {
            if self.conns.len() >= self.max_conns {
                break;
            }
            if peer.ctx.peer_id == self.ctx.local_id || self.conns.contains_key(&peer.ctx.peer_id) {
                continue;
            }
            self.dial(peer.ctx);
        }
    }

    fn dial(&mut self, remote: PeerContext) {
        let peer_id = remote.peer_id;
        tracing::info!("dialing peer {} at {}", peer_id, remote.addr());
        let handle = PeerSession::spawn_outbound(remote.addr(), peer_id, self.ctx.clone());
        self.conns.insert(peer_id, handle);
    }

    // The pair (local, remote) is unique per info-hash: duplicates and
    // self-connections are dropped before a session starts.
    async fn accept_inbound(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
        handshake: Handshake,
        addr: SocketAddr,
    ) {
        let peer_id = handshake.peer_id();
        if peer_id == self.ctx.local_id {
            tracing::warn!("dropping connection from ourselves");
            return;
        }
        if self.conns.contains_key(&peer_id) {
            tracing::warn!("connection from {} already exists", peer_id);
            return;
        }
        if self.conns.len() >= self.max_conns {
            tracing::warn!("connection limit reached, dropping {}", addr);
            return;
        }

        let handle = PeerSession::spawn_inbound(socket, peer_id, addr, self.ctx.clone());
        self.conns.insert(peer_id, handle);
    }

    async fn handle_piece_written(&mut self, idx: u32) {

        // Cancel outstanding requests for idx everywhere and advertise.
        for conn in self.conns.values() {
            conn.conn_tx.send(ConnCommand::PieceWritten(idx)).ok();
        }

        let missing = self.ctx.pieces.read().await.num_missing();
        tracing::info!("piece {} written, {} pieces remain", idx, missing);

        if missing == 0 {
            if let Err(e) = self.ctx.store.seal() {
                tracing::error!("sealing completed blob failed: {}", e);
                return;
            }
            tracing::info!("download complete, now seeding");
            self.done_tx.send(true).ok();
            // Tell the tracker we are a seeder right away.
            self.announce_and_dial().await;
        }
    }

    // Close every connection and wait for each to drain.
    async fn shutdown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.conns.len());
        for conn in self.conns.values() {
            conn.conn_tx.send(ConnCommand::Shutdown).ok();
        }

        for (peer_id, mut conn) in self.conns.drain() {
            if let Some(task) = conn.task.take() {
                if let Err(e) = task.await {
                    tracing::warn!("session {} panicked: {}", peer_id, e);
                }
            }
        }
    }
}
