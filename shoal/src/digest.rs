use std::io::Read;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

// Shards are addressed by the first four hex characters of a digest.
pub const SHARD_PREFIX_LEN: usize = 4;

const ALGO_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {

    #[error("digest must start with 'sha256:'")]
    UnsupportedAlgorithm,

    #[error("digest value must be {HEX_LEN} lowercase hex characters")]
    InvalidHex,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// A content address: the lowercase hex SHA-256 of a blob's bytes.
// Canonical string form is "sha256:<64-hex>".
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {

    pub fn from_hex(hex: &str) -> Result<Self, DigestError> {
        if hex.len() != HEX_LEN || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::InvalidHex);
        }
        Ok(Digest { hex: hex.to_owned() })
    }

    pub fn compute(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest { hex: hex::encode(hasher.finalize()) }
    }

    pub fn from_reader<R: Read>(mut r: R) -> Result<(Self, u64), DigestError> {
        let mut digester = Digester::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        Ok(digester.finish())
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    // First SHARD_PREFIX_LEN hex characters, the unit of replication.
    pub fn shard_id(&self) -> &str {
        &self.hex[..SHARD_PREFIX_LEN]
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix(ALGO_PREFIX).ok_or(DigestError::UnsupportedAlgorithm)?;
        Digest::from_hex(hex)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", ALGO_PREFIX, self.hex)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

// Digests travel on the wire in canonical string form.
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// Streaming SHA-256, for hashing uploads chunk by chunk.
pub struct Digester {
    hasher: Sha256,
    len: u64,
}

impl Digester {

    pub fn new() -> Self {
        Digester { hasher: Sha256::new(), len: 0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }

    pub fn finish(self) -> (Digest, u64) {
        (Digest { hex: hex::encode(self.hasher.finalize()) }, self.len)
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_vector() {
        let d = Digest::compute(b"hello");
        assert_eq!(d.hex(), "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        assert_eq!(d.to_string(), "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        assert_eq!(d.shard_id(), "2cf2");
    }

    #[test]
    fn test_parse_round_trip() {
        let s = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let d: Digest = s.parse().unwrap();
        assert_eq!(d.to_string(), s);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!("md5:abcd".parse::<Digest>(), Err(DigestError::UnsupportedAlgorithm)));
        assert!(matches!("sha256:abcd".parse::<Digest>(), Err(DigestError::InvalidHex)));
        // Uppercase hex is not canonical.
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(matches!(upper.parse::<Digest>(), Err(DigestError::InvalidHex)));
    }

    #[test]
    fn test_digester_matches_compute() {
        let data = vec![0xabu8; 100_000];
        let mut digester = Digester::new();
        for chunk in data.chunks(7777) {
            digester.update(chunk);
        }
        let (streamed, len) = digester.finish();
        assert_eq!(len, data.len() as u64);
        assert_eq!(streamed, Digest::compute(&data));
    }

    #[test]
    fn test_from_reader() {
        let data = b"some blob bytes".to_vec();
        let (d, len) = Digest::from_reader(&data[..]).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(d, Digest::compute(&data));
    }
}
