use tokio::{sync::mpsc, task::JoinHandle};
use shoal::PeerId;
use crate::archive::ArchiveError;

mod handshake;
mod message;
mod session;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;

pub type Result<T> = std::result::Result<T, ConnError>;
pub type ConnRx = mpsc::UnboundedReceiver<ConnCommand>;
pub type ConnTx = mpsc::UnboundedSender<ConnCommand>;

#[derive(thiserror::Error, Debug)]
pub enum ConnError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("connected to self")]
    SelfConnection,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent after introduction")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for ConnError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        ConnError::Channel(e.to_string())
    }
}

// Commands a torrent sends to one of its connections.
pub enum ConnCommand {

    // A piece was written and verified locally; advertise or cancel.
    PieceWritten(u32),

    Shutdown,

}

// A running peer connection, owned by its torrent.
#[derive(Debug)]
pub struct ConnHandle {

    pub peer_id: PeerId,

    pub conn_tx: ConnTx,

    // Option so shutdown can move the handle out for awaiting.
    pub task: Option<JoinHandle<()>>,

}
