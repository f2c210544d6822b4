mod announce;
mod archive;
mod block;
mod client;
mod config;
mod conn;
mod piece;
mod scheduler;
mod torrent;

// Blocks are the sub-piece transfer unit on the wire.
const BLOCK_SIZE: u64 = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use announce::{AnnounceClient, AnnounceError, MetaInfoStatus};
pub use archive::{Archive, ArchiveError, TorrentStore};
pub use client::{PeerClient, PeerClientError};
pub use config::PeerConfig;
pub use torrent::TorrentError;
