use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};
use sha1::{Digest as _, Sha1};
use shoal::{
    store::{CasStore, FileError, MetadataKind},
    Digest, MetaInfo, MetaInfoError,
};
use crate::block::BlockInfo;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("block out of bounds: piece {piece_idx} offset {offset} len {len}")]
    OutOfBounds { piece_idx: u32, offset: u32, len: u32 },
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

// Bridges CAS entries to piece-addressable torrent storage. Cached blobs
// open as seed stores; missing blobs open as leech stores writing into a
// CAS upload file that is sealed on completion.
#[derive(Debug, Clone)]
pub struct Archive {
    cas: Arc<CasStore>,
}

impl Archive {

    pub fn new(cas: Arc<CasStore>) -> Self {
        Archive { cas }
    }

    pub fn cas(&self) -> &Arc<CasStore> {
        &self.cas
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.cas.has_cache(digest)
    }

    // Metainfo previously stored beside the blob.
    pub fn cached_metainfo(&self, digest: &Digest) -> Result<MetaInfo> {
        let bytes = self.cas.get_metadata(digest, MetadataKind::TorrentMeta)?;
        Ok(MetaInfo::from_bytes(&bytes)?)
    }

    pub fn open_seed(&self, digest: &Digest, metainfo: MetaInfo) -> Result<Arc<TorrentStore>> {
        let file = self.cas.get_cache(digest)?;
        if !self.cas.has_metadata(digest, MetadataKind::TorrentMeta) {
            self.cas.set_metadata(digest, MetadataKind::TorrentMeta, &metainfo.to_bytes()?)?;
        }
        Ok(Arc::new(TorrentStore {
            cas: self.cas.clone(),
            digest: digest.clone(),
            metainfo,
            file: Mutex::new(file),
            upload_uuid: Mutex::new(None),
        }))
    }

    pub fn create_leech(&self, digest: &Digest, metainfo: MetaInfo) -> Result<Arc<TorrentStore>> {
        let uuid = format!("torrent-{}", uuid::Uuid::new_v4());
        self.cas.create_upload(&uuid)?;
        let file = self.cas.open_upload(&uuid)?;
        // Pre-size so blocks can land at any offset.
        file.set_len(metainfo.total_len())?;
        Ok(Arc::new(TorrentStore {
            cas: self.cas.clone(),
            digest: digest.clone(),
            metainfo,
            file: Mutex::new(file),
            upload_uuid: Mutex::new(Some(uuid)),
        }))
    }
}

// Piece-addressable view over one blob file. Reads and writes share a
// file-lock; pieces are immutable once verified and the blob itself is
// immutable once sealed.
#[derive(Debug)]
pub struct TorrentStore {

    cas: Arc<CasStore>,

    digest: Digest,

    metainfo: MetaInfo,

    file: Mutex<fs::File>,

    // Present while leeching; taken by seal.
    upload_uuid: Mutex<Option<String>>,

}

impl TorrentStore {

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn metainfo(&self) -> &MetaInfo {
        &self.metainfo
    }

    // True once the blob is (or was opened) fully present in cache.
    pub fn is_seed(&self) -> bool {
        self.upload_uuid
            .lock()
            .map(|uuid| uuid.is_none())
            .unwrap_or(false)
    }

    pub fn read_piece(&self, piece_idx: u32, offset: u32, len: u32) -> Result<Vec<u8>> {
        let block = BlockInfo { piece_idx, offset, len };
        if !block.is_valid(&self.metainfo) {
            return Err(ArchiveError::OutOfBounds { piece_idx, offset, len });
        }

        let pos = self.metainfo.piece_offset(piece_idx) + offset as u64;
        let mut buf = vec![0u8; len as usize];
        let mut file = self.file.lock().map_err(|_| ArchiveError::Poisoned)?;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_block(&self, block: &BlockInfo) -> Result<Vec<u8>> {
        self.read_piece(block.piece_idx, block.offset, block.len)
    }

    // Write a fully assembled, verified piece.
    pub fn write_piece(&self, piece_idx: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64, self.metainfo.piece_len(piece_idx));
        let pos = self.metainfo.piece_offset(piece_idx);
        let mut file = self.file.lock().map_err(|_| ArchiveError::Poisoned)?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    // Hash piece idx as stored and compare against the metainfo.
    pub fn verify_piece(&self, piece_idx: u32) -> Result<bool> {
        let len = self.metainfo.piece_len(piece_idx);
        let data = self.read_piece(piece_idx, 0, len as u32)?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        Ok(hash == self.metainfo.piece_hashes()[piece_idx as usize])
    }

    // Promote a completed leech store into the cache. Losing a seal race
    // to a concurrent writer of the same digest is success.
    pub fn seal(&self) -> Result<()> {
        let uuid = {
            let mut guard = self.upload_uuid.lock().map_err(|_| ArchiveError::Poisoned)?;
            match guard.take() {
                Some(uuid) => uuid,
                // Already sealed, or opened as a seed.
                None => return Ok(()),
            }
        };

        match self.cas.seal(&uuid, &self.digest) {
            Ok(()) | Err(FileError::Exists) => {}
            Err(e) => return Err(e.into()),
        }
        self.cas
            .set_metadata(&self.digest, MetadataKind::TorrentMeta, &self.metainfo.to_bytes()?)?;
        tracing::info!("sealed {} into local cache", self.digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let cas = Arc::new(CasStore::new(dir.path()).unwrap());
        (dir, Archive::new(cas))
    }

    fn blob(len: usize) -> (Vec<u8>, Digest, MetaInfo) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let digest = Digest::compute(&data);
        let metainfo = MetaInfo::generate(&data[..], digest.hex(), 1024).unwrap();
        (data, digest, metainfo)
    }

    #[test]
    fn test_leech_write_verify_seal_then_seed() {
        let (_dir, archive) = archive();
        let (data, digest, metainfo) = blob(3000);

        let store = archive.create_leech(&digest, metainfo.clone()).unwrap();
        for idx in 0..metainfo.num_pieces() {
            let off = metainfo.piece_offset(idx) as usize;
            let len = metainfo.piece_len(idx) as usize;
            store.write_piece(idx, &data[off..off + len]).unwrap();
            assert!(store.verify_piece(idx).unwrap());
        }
        store.seal().unwrap();
        // Second seal is a no-op.
        store.seal().unwrap();

        assert!(archive.has_blob(&digest));
        let seed = archive.open_seed(&digest, archive.cached_metainfo(&digest).unwrap()).unwrap();
        let back = seed.read_piece(2, 0, metainfo.piece_len(2) as u32).unwrap();
        assert_eq!(back, &data[2048..3000]);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_dir, archive) = archive();
        let (data, digest, metainfo) = blob(2048);
        let store = archive.create_leech(&digest, metainfo.clone()).unwrap();
        store.write_piece(0, &data[..1024]).unwrap();
        store.write_piece(1, &vec![0xEE; 1024]).unwrap();
        assert!(store.verify_piece(0).unwrap());
        assert!(!store.verify_piece(1).unwrap());
    }

    #[test]
    fn test_out_of_bounds_read_rejected() {
        let (_dir, archive) = archive();
        let (_, digest, metainfo) = blob(100);
        let store = archive.create_leech(&digest, metainfo).unwrap();
        assert!(matches!(
            store.read_piece(0, 90, 20),
            Err(ArchiveError::OutOfBounds { .. }),
        ));
    }

    #[test]
    fn test_open_seed_requires_cache() {
        let (_dir, archive) = archive();
        let (_, digest, metainfo) = blob(100);
        assert!(matches!(
            archive.open_seed(&digest, metainfo),
            Err(ArchiveError::File(FileError::NotFound)),
        ));
    }
}
