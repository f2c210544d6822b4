use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tracing::Instrument;
use shoal::PeerId;
use crate::{
    block::{BlockData, BlockInfo},
    piece::PieceBuf,
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{
    handshake::{Handshake, HandshakeCodec, PROTOCOL},
    message::{Message, MessageCodec},
    ConnCommand, ConnError, ConnHandle, ConnRx, ConnTx, Result,
};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Pieces assembled per connection at once.
const ASSIGN_LIMIT: usize = 4;

const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(10);
const IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(60);
const KEEPALIVE_INTERVAL: time::Duration = time::Duration::from_secs(25);

// One long-lived connection to a remote peer: a read loop over framed
// messages and a command channel from the owning torrent, multiplexed
// with a housekeeping tick.
pub struct PeerSession {

    addr: SocketAddr,

    remote_id: PeerId,

    ctx: Arc<TorrentContext>,

    conn_rx: ConnRx,

    // Kept so the session can ask itself to shut down.
    conn_tx: ConnTx,

    // Pieces the remote has.
    bitfield: Bitfield,

    // Block requests sent and not yet answered.
    requests_out: HashSet<BlockInfo>,

    // Blocks picked but not yet requested.
    pending_out: VecDeque<BlockInfo>,

    // Assembly buffers for pieces assigned to this connection.
    assembling: HashMap<u32, PieceBuf>,

    peer_choking: bool,

    // A bitfield is only valid directly after the handshake.
    introduced: bool,

    last_recv: Instant,

    last_send: Instant,

}

impl PeerSession {

    fn new(addr: SocketAddr, remote_id: PeerId, ctx: Arc<TorrentContext>) -> (Self, ConnTx) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let num_pieces = ctx.piece_hashes.len();
        (
            PeerSession {
                addr,
                remote_id,
                ctx,
                conn_rx,
                conn_tx: conn_tx.clone(),
                bitfield: Bitfield::repeat(false, num_pieces),
                requests_out: HashSet::new(),
                pending_out: VecDeque::new(),
                assembling: HashMap::new(),
                peer_choking: true,
                introduced: false,
                last_recv: Instant::now(),
                last_send: Instant::now(),
            },
            conn_tx,
        )
    }

    pub fn spawn_outbound(addr: SocketAddr, remote_id: PeerId, ctx: Arc<TorrentContext>) -> ConnHandle {
        let (mut session, conn_tx) = PeerSession::new(addr, remote_id, ctx);
        let task = tokio::spawn(
            async move {
                if let Err(e) = session.start_outbound().await {
                    tracing::warn!("session error: {}", e);
                }
                session.teardown().await;
            }
            .instrument(tracing::info_span!("peer", addr = %addr)),
        );
        ConnHandle { peer_id: remote_id, conn_tx, task: Some(task) }
    }

    // The scheduler has already read and validated the handshake.
    pub fn spawn_inbound(
        socket: Framed<TcpStream, HandshakeCodec>,
        remote_id: PeerId,
        addr: SocketAddr,
        ctx: Arc<TorrentContext>,
    ) -> ConnHandle {
        let (mut session, conn_tx) = PeerSession::new(addr, remote_id, ctx);
        let task = tokio::spawn(
            async move {
                if let Err(e) = session.start_inbound(socket).await {
                    tracing::warn!("session error: {}", e);
                }
                session.teardown().await;
            }
            .instrument(tracing::info_span!("peer", addr = %addr)),
        );
        ConnHandle { peer_id: remote_id, conn_tx, task: Some(task) }
    }

    async fn start_outbound(&mut self) -> Result<()> {

        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| ConnError::Timeout)??;
        let mut socket = Framed::new(stream, HandshakeCodec);

        tracing::trace!("send handshake");
        socket.send(Handshake::new(self.ctx.info_hash, self.ctx.local_id)).await?;

        let handshake = match socket.next().await {
            Some(Ok(handshake)) => handshake,
            Some(Err(e)) => return Err(e),
            None => return Err(ConnError::NoHandshake),
        };
        if handshake.protocol != PROTOCOL {
            return Err(ConnError::IncorrectProtocol);
        }
        if handshake.info_hash != self.ctx.info_hash {
            return Err(ConnError::IncorrectInfoHash);
        }
        if handshake.peer_id() == self.ctx.local_id {
            return Err(ConnError::SelfConnection);
        }
        if handshake.peer_id() != self.remote_id {
            tracing::warn!(
                "peer {} answered as {}",
                self.remote_id,
                handshake.peer_id(),
            );
            return Err(ConnError::InvalidMessage);
        }

        tracing::debug!("handshake successful, peer connected");
        // Keep any bytes the peer pipelined after its handshake.
        self.run(socket.map_codec(|_| MessageCodec)).await
    }

    async fn start_inbound(&mut self, mut socket: Framed<TcpStream, HandshakeCodec>) -> Result<()> {
        tracing::trace!("send handshake reply");
        socket.send(Handshake::new(self.ctx.info_hash, self.ctx.local_id)).await?;
        self.run(socket.map_codec(|_| MessageCodec)).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        let (mut sink, mut stream) = socket.split();

        // Introduce ourselves, then open the tap.
        let own_bitfield = self.ctx.bitfield().await;
        self.send(&mut sink, Message::Bitfield(own_bitfield)).await?;
        self.send(&mut sink, Message::Unchoke).await?;

        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        self.last_recv = Instant::now();
                        self.handle_msg(&mut sink, msg).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    // Remote closed the connection.
                    None => break,
                }
            }

            Some(cmd) = self.conn_rx.recv() => {
                match cmd {

                    ConnCommand::PieceWritten(idx) => {
                        self.handle_written_piece(&mut sink, idx).await?;
                    }

                    ConnCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        break;
                    }

                }
            }

            _ = ticker.tick() => self.tick(&mut sink).await?,

        }}

        Ok(())
    }

    // Release assignments and tell the torrent the loop has drained.
    async fn teardown(&mut self) {
        self.ctx.release_all(self.remote_id).await;
        self.ctx.torrent_tx
            .send(TorrentCommand::ConnClosed { peer_id: self.remote_id })
            .ok();
    }

    async fn send(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        self.last_send = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::Bitfield(bitfield) => self.handle_bitfield(sink, bitfield).await?,

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.peer_choking {
                    self.peer_choking = true;
                    self.free_assignments().await;
                }
            },

            Message::Unchoke => {
                if self.peer_choking {
                    self.peer_choking = false;
                    self.try_requests(sink).await?;
                }
            },

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Request(block) => self.handle_request(sink, block).await?,

            Message::Piece(block) => {
                self.handle_block(block).await?;
                self.try_requests(sink).await?;
            },

            Message::Cancel(block) => {
                // Blocks are served inline, so there is nothing queued to
                // withdraw.
                tracing::trace!("cancel for {:?}", block);
            },

        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        if self.introduced {
            tracing::error!("bitfield after introduction");
            return Err(ConnError::UnexpectedBitfield);
        }
        self.introduced = true;

        let num_pieces = self.ctx.piece_hashes.len();
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        // Remove trailing padding bits.
        bitfield.resize(num_pieces, false);
        self.bitfield = bitfield;

        // Two complete peers have nothing to exchange.
        if self.bitfield.all() && self.ctx.is_complete().await {
            tracing::debug!("both sides complete, closing");
            self.conn_tx.send(ConnCommand::Shutdown)?;
            return Ok(());
        }

        self.try_requests(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx as usize >= self.bitfield.len() {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(ConnError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.try_requests(sink).await
    }

    // Serve a block off local storage.
    async fn handle_request(&mut self, sink: &mut MessageSink, block: BlockInfo) -> Result<()> {

        if !block.is_valid(self.ctx.store.metainfo()) {
            tracing::error!("invalid request: {:?}", block);
            return Err(ConnError::InvalidMessage);
        }
        if !self.ctx.has_piece(block.piece_idx).await {
            tracing::warn!("request for piece {} we don't have", block.piece_idx);
            return Err(ConnError::InvalidMessage);
        }

        let data = self.ctx.store.read_block(&block)?;
        self.send(sink, Message::Piece(BlockData {
            piece_idx: block.piece_idx,
            offset: block.offset,
            data,
        })).await
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = block.info();
        if !self.requests_out.remove(&info) {
            tracing::warn!("unexpected block: {:?}", info);
            return Ok(());
        }

        let Some(piece) = self.assembling.get_mut(&info.piece_idx) else {
            tracing::warn!("block for unassigned piece: {:?}", info);
            return Ok(());
        };
        piece.add_block(&block);
        if !piece.is_complete() {
            return Ok(());
        }

        let piece = self.assembling.remove(&info.piece_idx).expect("assembled piece present");
        let idx = info.piece_idx;

        if !piece.verify() {
            // Hand the piece back for re-request; the remote may be
            // corrupt or lying.
            tracing::warn!("piece {} failed verification", idx);
            self.ctx.release_piece(idx, self.remote_id).await;
            return Ok(());
        }

        // Storage write happens before anyone is told about the piece.
        self.ctx.store.write_piece(idx, &piece.data)?;
        if self.ctx.complete_piece(idx).await {
            self.ctx.torrent_tx.send(TorrentCommand::PieceWritten { idx })?;
        }
        Ok(())
    }

    // When a piece completes locally: advertise it to peers that lack
    // it, withdraw any of our own outstanding requests for it.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {

        if !self.bitfield[idx as usize] {
            self.send(sink, Message::Have { idx }).await?;
        }

        self.assembling.remove(&idx);
        self.pending_out.retain(|b| b.piece_idx != idx);
        let stale: Vec<BlockInfo> = self.requests_out
            .iter()
            .filter(|b| b.piece_idx == idx)
            .copied()
            .collect();
        for block in stale {
            self.requests_out.remove(&block);
            self.send(sink, Message::Cancel(block)).await?;
        }

        Ok(())
    }

    // Top up piece assignments and keep the request pipeline full.
    async fn try_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.peer_choking {
            return Ok(());
        }

        while self.assembling.len() < ASSIGN_LIMIT {
            match self.ctx.pick_piece(&self.bitfield, self.remote_id).await {
                Some(idx) => {
                    let hash = self.ctx.piece_hashes[idx as usize];
                    let len = self.ctx.store.metainfo().piece_len(idx);
                    self.assembling.insert(idx, PieceBuf::new(hash, len));
                    self.pending_out.extend(BlockInfo::blocks_of(self.ctx.store.metainfo(), idx));
                }
                None => break,
            }
        }

        while self.requests_out.len() < self.ctx.request_pipeline {
            let Some(block) = self.pending_out.pop_front() else { break };
            self.requests_out.insert(block);
            self.send(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    // Free everything assigned here so other connections can pick it up.
    async fn free_assignments(&mut self) {
        tracing::debug!("peer choked us, freeing {} pieces", self.assembling.len());
        for idx in self.assembling.keys().copied().collect::<Vec<_>>() {
            self.ctx.release_piece(idx, self.remote_id).await;
        }
        self.assembling.clear();
        self.pending_out.clear();
        self.requests_out.clear();
    }

    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.last_recv.elapsed() >= IDLE_TIMEOUT {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(ConnError::Timeout);
        }

        if self.last_send.elapsed() >= KEEPALIVE_INTERVAL {
            self.send(sink, Message::KeepAlive).await?;
        }

        Ok(())
    }
}
