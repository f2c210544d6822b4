use std::fs;
use crate::digest::Digest;
use super::{cas::CasStore, FileError, Result};

// Sidecar metadata kinds stored beside a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {

    // Serialized metainfo for the blob.
    TorrentMeta,

    // Marks the blob for backend write-back / pinning.
    Persist,

    // External reference count.
    Refcount,

}

impl MetadataKind {

    pub const ALL: [MetadataKind; 3] = [
        MetadataKind::TorrentMeta,
        MetadataKind::Persist,
        MetadataKind::Refcount,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            MetadataKind::TorrentMeta => "_metainfo",
            MetadataKind::Persist => "_persist",
            MetadataKind::Refcount => "_refcount",
        }
    }
}

impl CasStore {

    fn metadata_path(&self, hex: &str, kind: MetadataKind) -> std::path::PathBuf {
        let blob = self.cache_path(hex);
        blob.with_file_name(format!("{}{}", hex, kind.suffix()))
    }

    pub fn get_metadata(&self, digest: &Digest, kind: MetadataKind) -> Result<Vec<u8>> {
        fs::read(self.metadata_path(digest.hex(), kind)).map_err(FileError::from_io)
    }

    // Sidecars only exist for cached blobs.
    pub fn set_metadata(&self, digest: &Digest, kind: MetadataKind, bytes: &[u8]) -> Result<()> {
        let hex = digest.hex();
        let lock = self.lock_key(hex);
        let _guard = lock.lock().expect("cas digest lock poisoned");

        if !self.has_cache(digest) {
            return Err(FileError::NotFound);
        }
        let path = self.metadata_path(hex, kind);
        // Write-then-rename so readers never observe a torn sidecar.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn has_metadata(&self, digest: &Digest, kind: MetadataKind) -> bool {
        self.metadata_path(digest.hex(), kind).exists()
    }

    pub fn incref(&self, digest: &Digest) -> Result<i64> {
        self.adjust_refcount(digest, 1)
    }

    pub fn decref(&self, digest: &Digest) -> Result<i64> {
        self.adjust_refcount(digest, -1)
    }

    pub fn refcount(&self, digest: &Digest) -> Result<i64> {
        let lock = self.lock_key(digest.hex());
        let _guard = lock.lock().expect("cas digest lock poisoned");
        self.read_refcount(digest)
    }

    fn adjust_refcount(&self, digest: &Digest, delta: i64) -> Result<i64> {
        let hex = digest.hex();
        let lock = self.lock_key(hex);
        let _guard = lock.lock().expect("cas digest lock poisoned");

        if !self.has_cache(digest) {
            return Err(FileError::NotFound);
        }

        let count = self.read_refcount(digest)?;
        let next = count + delta;
        if next < 0 {
            // A reference was released twice; this must fail loudly.
            return Err(FileError::Corrupt(format!(
                "refcount for {} would drop below zero",
                digest,
            )));
        }

        let path = self.metadata_path(hex, MetadataKind::Refcount);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, next.to_string())?;
        fs::rename(&tmp, &path)?;
        Ok(next)
    }

    fn read_refcount(&self, digest: &Digest) -> Result<i64> {
        match fs::read_to_string(self.metadata_path(digest.hex(), MetadataKind::Refcount)) {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| FileError::Corrupt(format!("unparseable refcount for {}", digest))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use super::*;

    fn cached(cas: &CasStore, content: &[u8]) -> Digest {
        let digest = Digest::compute(content);
        cas.create_upload("meta-test").unwrap();
        cas.open_upload("meta-test").unwrap().write_all(content).unwrap();
        cas.seal("meta-test", &digest).unwrap();
        digest
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        let digest = cached(&cas, b"blob");

        assert!(matches!(
            cas.get_metadata(&digest, MetadataKind::TorrentMeta),
            Err(FileError::NotFound),
        ));
        cas.set_metadata(&digest, MetadataKind::TorrentMeta, b"meta bytes").unwrap();
        assert_eq!(
            cas.get_metadata(&digest, MetadataKind::TorrentMeta).unwrap(),
            b"meta bytes",
        );
        assert!(cas.has_metadata(&digest, MetadataKind::TorrentMeta));
    }

    #[test]
    fn test_metadata_requires_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        let digest = Digest::compute(b"not cached");
        assert!(matches!(
            cas.set_metadata(&digest, MetadataKind::Persist, b"1"),
            Err(FileError::NotFound),
        ));
    }

    #[test]
    fn test_refcount_up_down() {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        let digest = cached(&cas, b"counted");

        assert_eq!(cas.refcount(&digest).unwrap(), 0);
        assert_eq!(cas.incref(&digest).unwrap(), 1);
        assert_eq!(cas.incref(&digest).unwrap(), 2);
        assert_eq!(cas.decref(&digest).unwrap(), 1);
        assert_eq!(cas.decref(&digest).unwrap(), 0);
    }

    #[test]
    fn test_refcount_never_negative() {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        let digest = cached(&cas, b"counted");
        assert!(matches!(cas.decref(&digest), Err(FileError::Corrupt(_))));
        assert_eq!(cas.refcount(&digest).unwrap(), 0);
    }

    #[test]
    fn test_sidecars_removed_with_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        let digest = cached(&cas, b"with sidecar");
        cas.set_metadata(&digest, MetadataKind::Persist, b"1").unwrap();
        cas.delete_cache(&digest).unwrap();
        assert!(!cas.has_metadata(&digest, MetadataKind::Persist));
    }
}
