use shoal::MetaInfo;
use crate::BLOCK_SIZE;

// A request for a block: a sub-range of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {

    pub piece_idx: u32,

    // Byte offset within the piece.
    pub offset: u32,

    pub len: u32,

}

impl BlockInfo {

    pub fn is_valid(&self, metainfo: &MetaInfo) -> bool {
        if self.piece_idx >= metainfo.num_pieces() || self.len == 0 {
            return false;
        }
        let piece_len = metainfo.piece_len(self.piece_idx);
        (self.offset as u64 + self.len as u64) <= piece_len
    }

    // The blocks that make up piece idx, in offset order.
    pub fn blocks_of(metainfo: &MetaInfo, piece_idx: u32) -> Vec<BlockInfo> {
        let piece_len = metainfo.piece_len(piece_idx);
        let mut blocks = Vec::with_capacity(piece_len.div_ceil(BLOCK_SIZE) as usize);
        let mut offset = 0u64;
        while offset < piece_len {
            let len = BLOCK_SIZE.min(piece_len - offset);
            blocks.push(BlockInfo {
                piece_idx,
                offset: offset as u32,
                len: len as u32,
            });
            offset += len;
        }
        blocks
    }
}

// A block with its payload, as carried by a Piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    pub piece_idx: u32,

    pub offset: u32,

    pub data: Vec<u8>,

}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metainfo() -> MetaInfo {
        // 100_000 bytes, 65536-byte pieces: one full piece + one short.
        let blob = vec![0u8; 100_000];
        MetaInfo::generate(&blob[..], "blob", 65536).unwrap()
    }

    #[test]
    fn test_blocks_cover_piece() {
        let m = metainfo();
        let blocks = BlockInfo::blocks_of(&m, 0);
        assert_eq!(blocks.len(), 4);
        assert!(blocks.iter().all(|b| b.len == BLOCK_SIZE as u32));

        let last = BlockInfo::blocks_of(&m, 1);
        let total: u64 = last.iter().map(|b| b.len as u64).sum();
        assert_eq!(total, m.piece_len(1));
        // Short trailing block.
        assert_eq!(last.last().unwrap().len as u64, m.piece_len(1) % BLOCK_SIZE);
    }

    #[test]
    fn test_validity_bounds() {
        let m = metainfo();
        assert!(BlockInfo { piece_idx: 0, offset: 0, len: 16384 }.is_valid(&m));
        assert!(!BlockInfo { piece_idx: 2, offset: 0, len: 1 }.is_valid(&m));
        assert!(!BlockInfo { piece_idx: 0, offset: 65536, len: 1 }.is_valid(&m));
        assert!(!BlockInfo { piece_idx: 0, offset: 0, len: 0 }.is_valid(&m));
    }
}
