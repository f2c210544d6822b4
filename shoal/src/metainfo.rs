use std::io::Read;
use serde_derive::{Deserialize, Serialize};

// Piece size used when the caller does not choose one.
pub const DEFAULT_PIECE_LENGTH: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst coding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("piece length {0} is not a power of two")]
    InvalidPieceLength(u64),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("piece count {actual} does not match blob length (expected {expected})")]
    PieceCountMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, MetaInfoError>;

// The info dictionary. Field order is the canonical (sorted) bencode key
// order, so encoding is deterministic: the info-hash is a pure function
// of these fields.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Length of the blob in bytes.
    pub length: u64,

    // Blob name, by convention the digest hex.
    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u64,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

}

impl Info {
    // SHA1 of the canonical bencode of the info dict, the torrent-layer
    // identity of a blob.
    fn info_hash(&self) -> Result<[u8; 20]> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        let info_data = serde_bencode::to_bytes(&self)?;
        hasher.update(info_data);
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone)]
pub struct MetaInfo {

    pub info: Info,

    // Cached sha1 hash of the info dict.
    info_hash: [u8; 20],

}

impl MetaInfo {

    // Split a blob into pieces, hashing each. Pure: identical inputs yield
    // byte-identical metainfo.
    pub fn generate<R: Read>(mut blob: R, name: &str, piece_length: u64) -> Result<MetaInfo> {
        use sha1::Digest;

        if piece_length == 0 || !piece_length.is_power_of_two() {
            return Err(MetaInfoError::InvalidPieceLength(piece_length));
        }

        let mut pieces = Vec::new();
        let mut length: u64 = 0;
        let mut buf = vec![0u8; piece_length as usize];

        loop {
            // A piece may arrive over several reads.
            let mut filled = 0;
            while filled < buf.len() {
                let n = blob.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let mut hasher = sha1::Sha1::new();
            hasher.update(&buf[..filled]);
            pieces.extend_from_slice(&hasher.finalize());
            length += filled as u64;

            if filled < buf.len() {
                break;
            }
        }

        let info = Info {
            length,
            name: name.to_owned(),
            piece_length,
            pieces,
        };
        let info_hash = info.info_hash()?;
        Ok(MetaInfo { info, info_hash })
    }

    pub fn from_info(info: Info) -> Result<MetaInfo> {
        if info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        let expected = info.length.div_ceil(info.piece_length.max(1));
        let actual = (info.pieces.len() / 20) as u64;
        if expected != actual {
            return Err(MetaInfoError::PieceCountMismatch { expected, actual });
        }
        let info_hash = info.info_hash()?;
        Ok(MetaInfo { info, info_hash })
    }

    // Sidecar serialization: the canonical bencode of the info dict.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(&self.info)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo> {
        let info: Info = serde_bencode::from_bytes(bytes)?;
        MetaInfo::from_info(info)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn total_len(&self) -> u64 {
        self.info.length
    }

    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    pub fn num_pieces(&self) -> u32 {
        (self.info.pieces.len() / 20) as u32
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as length is validated to be a multiple of 20.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    // Length of piece idx; only the final piece may be short.
    pub fn piece_len(&self, idx: u32) -> u64 {
        debug_assert!(idx < self.num_pieces(), "piece index out of bounds");
        if idx == self.num_pieces() - 1 {
            let rem = self.info.length - self.piece_offset(idx);
            debug_assert!(rem <= self.info.piece_length);
            rem
        } else {
            self.info.piece_length
        }
    }

    pub fn piece_offset(&self, idx: u32) -> u64 {
        idx as u64 * self.info.piece_length
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("name", &self.info.name)
            .field("length", &self.info.length)
            .field("piece_length", &self.info.piece_length)
            .field("num_pieces", &self.num_pieces())
            .field("info_hash", &self.info_hash_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_short_last_piece() {
        let blob = vec![0x5au8; 1000];
        let m = MetaInfo::generate(&blob[..], "blob", 128).unwrap();
        assert_eq!(m.total_len(), 1000);
        assert_eq!(m.num_pieces(), 8);
        assert_eq!(m.piece_len(0), 128);
        assert_eq!(m.piece_len(7), 1000 - 7 * 128);
    }

    #[test]
    fn test_generate_blob_smaller_than_piece() {
        let m = MetaInfo::generate(&b"hello"[..], "blob", 16384).unwrap();
        assert_eq!(m.num_pieces(), 1);
        assert_eq!(m.piece_len(0), 5);
    }

    #[test]
    fn test_generate_exact_multiple() {
        let blob = vec![0u8; 1024];
        let m = MetaInfo::generate(&blob[..], "blob", 256).unwrap();
        assert_eq!(m.num_pieces(), 4);
        assert_eq!(m.piece_len(3), 256);
    }

    #[test]
    fn test_generate_rejects_bad_piece_length() {
        assert!(matches!(
            MetaInfo::generate(&b"x"[..], "blob", 1000),
            Err(MetaInfoError::InvalidPieceLength(1000)),
        ));
    }

    #[test]
    fn test_generate_is_pure() {
        let blob = vec![0x11u8; 5000];
        let a = MetaInfo::generate(&blob[..], "blob", 512).unwrap();
        let b = MetaInfo::generate(&blob[..], "blob", 512).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(a.info_hash(), b.info_hash());
    }

    #[test]
    fn test_info_hash_is_sha1_of_canonical_info() {
        use sha1::Digest;
        let m = MetaInfo::generate(&b"content"[..], "blob", 64).unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&m.info).unwrap());
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(m.info_hash(), expected);
    }

    #[test]
    fn test_single_piece_hash_matches_data() {
        use sha1::Digest;
        let data = b"some piece data";
        let m = MetaInfo::generate(&data[..], "blob", 1024).unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(m.piece_hashes()[0], expected);
    }

    #[test]
    fn test_sidecar_round_trip() {
        let blob = vec![0xffu8; 3000];
        let m = MetaInfo::generate(&blob[..], "blob", 1024).unwrap();
        let bytes = m.to_bytes().unwrap();
        let back = MetaInfo::from_bytes(&bytes).unwrap();
        assert_eq!(back.info_hash(), m.info_hash());
        assert_eq!(back.total_len(), 3000);
        assert_eq!(back.num_pieces(), 3);
    }

    #[test]
    fn test_from_info_rejects_mismatched_piece_count() {
        let info = Info {
            length: 1024,
            name: "blob".into(),
            piece_length: 256,
            // 3 pieces claimed, 4 required.
            pieces: vec![0u8; 60],
        };
        assert!(matches!(
            MetaInfo::from_info(info),
            Err(MetaInfoError::PieceCountMismatch { expected: 4, actual: 3 }),
        ));
    }
}
