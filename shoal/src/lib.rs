pub mod announce;
mod digest;
mod hashring;
mod metainfo;
mod peer;
pub mod store;

pub use digest::{Digest, DigestError, Digester, SHARD_PREFIX_LEN};
pub use hashring::{HashRing, RingConfig, RingNode};
pub use metainfo::{MetaInfo, MetaInfoError, DEFAULT_PIECE_LENGTH};
pub use peer::{PeerContext, PeerId};
