use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::{BlockData, BlockInfo},
    Bitfield,
};
use super::ConnError;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // Advises the peer not to close the connection even when quiet.
    KeepAlive,

    // No further requests will be served.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The sender now has the piece at idx.
    Have { idx: u32 },

    // Short form of the sender's piece completion, sent once directly
    // after the handshake.
    Bitfield(Bitfield),

    // Ask for a block: piece index, offset within the piece, length.
    Request(BlockInfo),

    // A block payload.
    Piece(BlockData),

    // Withdraw an earlier request.
    Cancel(BlockInfo),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = ConnError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bitfield.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len = peeker.get_u32() as usize;

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }
        } else {
            // Haven't received all of the message.
            return Ok(None);
        }

        let msg = match src.get_u8() {
            0 => Message::Choke,
            1 => Message::Unchoke,
            4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Request(BlockInfo { piece_idx, offset, len })
            },
            7 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Piece(BlockData { piece_idx, offset, data })
            },
            8 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Cancel(BlockInfo { piece_idx, offset, len })
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(ConnError::InvalidMessageId(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Piece(block) => write!(f, "piece {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
        }
    }
}
