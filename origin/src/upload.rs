use std::{
    io::{Seek, SeekFrom, Write},
    sync::Arc,
};
use shoal::{
    store::{CasStore, FileError, MetadataKind},
    Digest, MetaInfo, MetaInfoError,
};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // The blob is already cached; clients treat this as success.
    #[error("digest already exists")]
    Conflict,

    #[error("invalid content range: {0}")]
    InvalidRange(String),

    // Upload bytes do not hash to the claimed digest. Fatal for this
    // upload, not a server fault.
    #[error("uploaded content hashes to {actual}, expected {expected}")]
    Corrupt { expected: Digest, actual: Digest },
}

pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {

    // Sealed into cache by this commit.
    Sealed,

    // Someone else sealed the same digest first; idempotent success.
    AlreadyExists,

}

// Chunked upload protocol over the CAS: start allocates a writable
// upload file, patch writes ranges, commit verifies the SHA-256 and
// seals. Also used origin-to-origin for transfers and repair.
#[derive(Debug, Clone)]
pub struct UploadManager {

    cas: Arc<CasStore>,

    piece_length: u64,

}

impl UploadManager {

    pub fn new(cas: Arc<CasStore>, piece_length: u64) -> Self {
        UploadManager { cas, piece_length }
    }

    // Returns the new upload id, or Conflict if the blob is cached.
    pub fn start(&self, digest: &Digest) -> Result<String> {
        if self.cas.has_cache(digest) {
            return Err(UploadError::Conflict);
        }
        let uid = uuid::Uuid::new_v4().to_string();
        self.cas.create_upload(&uid)?;
        tracing::debug!("started upload {} for {}", uid, digest);
        Ok(uid)
    }

    // Content-Range "start-end" (end exclusive): end - start must equal
    // the chunk length.
    pub fn patch(&self, uid: &str, range: &str, chunk: &[u8]) -> Result<()> {
        let (start, end) = parse_range(range)?;
        if end - start != chunk.len() as u64 {
            return Err(UploadError::InvalidRange(format!(
                "range {} does not cover {} bytes",
                range,
                chunk.len(),
            )));
        }

        let mut file = self.cas.open_upload(uid)?;
        file.seek(SeekFrom::Start(start))?;
        file.write_all(chunk)?;
        file.flush()?;
        Ok(())
    }

    // Verify and seal. A repeated commit of an already-sealed digest is
    // Conflict so retries are observably idempotent.
    pub fn commit(&self, digest: &Digest, uid: &str) -> Result<CommitOutcome> {

        let file = match self.cas.open_upload(uid) {
            Ok(file) => file,
            Err(FileError::NotFound) if self.cas.has_cache(digest) => {
                return Err(UploadError::Conflict);
            }
            Err(e) => return Err(e.into()),
        };

        let (actual, _) = Digest::from_reader(&file)
            .map_err(|e| UploadError::Io(std::io::Error::other(e.to_string())))?;
        if &actual != digest {
            // Corrupt content never reaches the cache namespace.
            self.cas.delete_upload(uid)?;
            return Err(UploadError::Corrupt { expected: digest.clone(), actual });
        }

        let outcome = match self.cas.seal(uid, digest) {
            Ok(()) => CommitOutcome::Sealed,
            Err(FileError::Exists) => CommitOutcome::AlreadyExists,
            Err(e) => return Err(e.into()),
        };

        self.ensure_metainfo(digest)?;
        tracing::info!("committed {} ({:?})", digest, outcome);
        Ok(outcome)
    }

    // Generate and persist the metainfo sidecar if it isn't there yet.
    pub fn ensure_metainfo(&self, digest: &Digest) -> Result<MetaInfo> {
        if self.cas.has_metadata(digest, MetadataKind::TorrentMeta) {
            let bytes = self.cas.get_metadata(digest, MetadataKind::TorrentMeta)?;
            return Ok(MetaInfo::from_bytes(&bytes)?);
        }
        self.regenerate_metainfo(digest, self.piece_length)
    }

    // Regenerate with a chosen piece length, replacing any sidecar.
    pub fn regenerate_metainfo(&self, digest: &Digest, piece_length: u64) -> Result<MetaInfo> {
        let file = self.cas.get_cache(digest)?;
        let metainfo = MetaInfo::generate(&file, digest.hex(), piece_length)?;
        self.cas.set_metadata(digest, MetadataKind::TorrentMeta, &metainfo.to_bytes()?)?;
        tracing::debug!(
            "generated metainfo for {}: {} pieces of {}",
            digest,
            metainfo.num_pieces(),
            piece_length,
        );
        Ok(metainfo)
    }

    pub fn mark_persist(&self, digest: &Digest) -> Result<()> {
        self.cas.set_metadata(digest, MetadataKind::Persist, b"1")?;
        Ok(())
    }

    pub fn clear_persist(&self, digest: &Digest) -> Result<()> {
        self.cas.set_metadata(digest, MetadataKind::Persist, b"0")?;
        Ok(())
    }
}

fn parse_range(range: &str) -> Result<(u64, u64)> {
    let invalid = || UploadError::InvalidRange(range.to_owned());
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}
