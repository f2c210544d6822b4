use sha1::{Digest, Sha1};
use crate::{block::BlockData, BLOCK_SIZE};

// In-memory assembly buffer for one piece being downloaded.
#[derive(Debug)]
pub struct PieceBuf {

    // Piece hash from the metainfo.
    pub hash: [u8; 20],

    // Length of the piece in bytes.
    pub len: u64,

    pub data: Vec<u8>,

    // Tracks received blocks, catches duplicates.
    blocks_received: Vec<bool>,

    num_blocks_received: usize,

}

impl PieceBuf {

    pub fn new(hash: [u8; 20], len: u64) -> Self {
        let num_blocks = len.div_ceil(BLOCK_SIZE) as usize;
        PieceBuf {
            hash,
            len,
            data: vec![0; len as usize],
            blocks_received: vec![false; num_blocks],
            num_blocks_received: 0,
        }
    }

    // Copies a block into the buffer. Returns false for duplicates.
    pub fn add_block(&mut self, block: &BlockData) -> bool {
        let block_idx = block.offset as u64 / BLOCK_SIZE;
        if self.blocks_received[block_idx as usize] {
            tracing::warn!(
                "duplicate block in piece {} at offset {}",
                block.piece_idx,
                block.offset,
            );
            return false;
        }
        self.blocks_received[block_idx as usize] = true;
        self.num_blocks_received += 1;
        let offset = block.offset as usize;
        self.data[offset..offset + block.data.len()].copy_from_slice(&block.data);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len()
    }

    // Hash the assembled piece and compare with the metainfo hash.
    pub fn verify(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn test_assemble_and_verify() {
        let data: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let mut piece = PieceBuf::new(hash_of(&data), data.len() as u64);

        for (i, chunk) in data.chunks(BLOCK_SIZE as usize).enumerate() {
            assert!(!piece.is_complete());
            let added = piece.add_block(&BlockData {
                piece_idx: 0,
                offset: (i as u64 * BLOCK_SIZE) as u32,
                data: chunk.to_vec(),
            });
            assert!(added);
        }

        assert!(piece.is_complete());
        assert!(piece.verify());
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let data = vec![7u8; 100];
        let mut piece = PieceBuf::new(hash_of(&data), 100);
        let block = BlockData { piece_idx: 0, offset: 0, data: data.clone() };
        assert!(piece.add_block(&block));
        assert!(!piece.add_block(&block));
        assert!(piece.is_complete());
    }

    #[test]
    fn test_corrupt_piece_fails_verify() {
        let data = vec![1u8; 200];
        let mut piece = PieceBuf::new(hash_of(&data), 200);
        piece.add_block(&BlockData { piece_idx: 0, offset: 0, data: vec![2u8; 200] });
        assert!(piece.is_complete());
        assert!(!piece.verify());
    }
}
