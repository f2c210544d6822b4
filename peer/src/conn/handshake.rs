use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use shoal::PeerId;
use super::ConnError;

pub const PROTOCOL: [u8; 19] = *b"shoal-blob-protocol";

// Fixed 68-byte opening frame: length-prefixed protocol tag, reserved
// bytes, the torrent identity, and the sender's peer id.
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {

    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            protocol:   PROTOCOL,
            reserved:   [0; 8],
            info_hash,
            peer_id:    *peer_id.as_bytes(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer_id)
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = ConnError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len() % 68, 0, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        let protocol_len = src[0];
        if protocol_len != 19 {
            return Err(ConnError::IncorrectProtocol);
        }

        if src.remaining() < 68 {
            // Handshake not fully received.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &hex::encode(self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let id = PeerId::random();
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([7u8; 20], id), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.protocol, PROTOCOL);
        assert_eq!(decoded.info_hash, [7u8; 20]);
        assert_eq!(decoded.peer_id(), id);
    }

    #[test]
    fn test_handshake_incomplete_returns_none() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"shoal-blob-protocol");
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_handshake_wrong_tag_length_rejected() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(&[0u8; 67]);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }
}
