use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use crate::digest::{Digest, SHARD_PREFIX_LEN};
use super::{FileError, Result};

const UPLOAD_DIR: &str = "upload";
const CACHE_DIR: &str = "cache";
const TRASH_DIR: &str = "trash";

#[derive(Debug, Clone)]
pub struct CacheStat {
    pub size: u64,
    pub mtime: SystemTime,
}

// The only durable on-disk representation of blobs and their sidecars.
//
// Layout under root:
//   upload/<uuid>            writable in-progress files
//   cache/<shard>/<hex>      sealed blobs, named by their SHA-256
//   cache/<shard>/<hex>_<k>  sidecar metadata, kind k
//   trash/<hex>.<millis>     deleted blobs pending collection
//
// Seal is an atomic rename; per-digest locks serialize seal and sidecar
// mutation against concurrent callers in this process.
#[derive(Debug)]
pub struct CasStore {

    root: PathBuf,

    // Per-digest-hex locks. See lock_key.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

}

impl CasStore {

    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [UPLOAD_DIR, CACHE_DIR, TRASH_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(CasStore {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub(super) fn lock_key(&self, hex: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("cas lock table poisoned");
        locks.entry(hex.to_owned()).or_default().clone()
    }

    fn upload_path(&self, uuid: &str) -> PathBuf {
        self.root.join(UPLOAD_DIR).join(uuid)
    }

    pub(super) fn cache_path(&self, hex: &str) -> PathBuf {
        self.root
            .join(CACHE_DIR)
            .join(&hex[..SHARD_PREFIX_LEN])
            .join(hex)
    }

    // Uploads.

    pub fn create_upload(&self, uuid: &str) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.upload_path(uuid))
            .map(|_| ())
            .map_err(FileError::from_io)
    }

    pub fn open_upload(&self, uuid: &str) -> Result<fs::File> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.upload_path(uuid))
            .map_err(FileError::from_io)
    }

    pub fn upload_size(&self, uuid: &str) -> Result<u64> {
        fs::metadata(self.upload_path(uuid))
            .map(|m| m.len())
            .map_err(FileError::from_io)
    }

    pub fn delete_upload(&self, uuid: &str) -> Result<()> {
        fs::remove_file(self.upload_path(uuid)).map_err(FileError::from_io)
    }

    // Atomic rename upload -> cache/<shard>/<hex>. A concurrent seal of the
    // same digest leaves one surviving file; the loser observes Exists,
    // which callers treat as success.
    pub fn seal(&self, uuid: &str, digest: &Digest) -> Result<()> {
        let hex = digest.hex();
        let lock = self.lock_key(hex);
        let _guard = lock.lock().expect("cas digest lock poisoned");

        let src = self.upload_path(uuid);
        if !src.exists() {
            return Err(FileError::NotFound);
        }

        let dst = self.cache_path(hex);
        if dst.exists() {
            // Duplicate content: drop the redundant upload.
            fs::remove_file(&src)?;
            return Err(FileError::Exists);
        }

        fs::create_dir_all(dst.parent().expect("cache path has parent"))?;
        fs::rename(&src, &dst)?;
        tracing::debug!("sealed {} into cache", digest);
        Ok(())
    }

    // Uploads abandoned by crashed writers. Removes any upload file older
    // than the deadline, returning how many were collected.
    pub fn purge_abandoned_uploads(&self, deadline: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut purged = 0;
        for entry in fs::read_dir(self.root.join(UPLOAD_DIR))? {
            let entry = entry?;
            let age = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= deadline {
                fs::remove_file(entry.path())?;
                purged += 1;
                tracing::warn!("purged abandoned upload {:?}", entry.file_name());
            }
        }
        Ok(purged)
    }

    // Cache.

    pub fn get_cache(&self, digest: &Digest) -> Result<fs::File> {
        fs::File::open(self.cache_path(digest.hex())).map_err(FileError::from_io)
    }

    pub fn stat_cache(&self, digest: &Digest) -> Result<CacheStat> {
        let meta = fs::metadata(self.cache_path(digest.hex())).map_err(FileError::from_io)?;
        Ok(CacheStat {
            size: meta.len(),
            mtime: meta.modified()?,
        })
    }

    pub fn has_cache(&self, digest: &Digest) -> bool {
        self.cache_path(digest.hex()).exists()
    }

    // Move a cache file (and its sidecars) into trash. The timestamped
    // suffix keeps repeated delete/recreate cycles from colliding.
    pub fn delete_cache(&self, digest: &Digest) -> Result<()> {
        let hex = digest.hex();
        let lock = self.lock_key(hex);
        let _guard = lock.lock().expect("cas digest lock poisoned");

        let src = self.cache_path(hex);
        if !src.exists() {
            return Err(FileError::NotFound);
        }

        let trash_name = format!("{}.{}", hex, chrono::Utc::now().timestamp_millis());
        fs::rename(&src, self.root.join(TRASH_DIR).join(trash_name))?;
        self.remove_sidecars(hex)?;
        tracing::info!("moved {} to trash", digest);
        Ok(())
    }

    pub fn list_cache_by_shard(&self, shard_id: &str) -> Result<Vec<String>> {
        let dir = self.root.join(CACHE_DIR).join(shard_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            // Sidecars carry a suffix; blobs are bare 64-hex names.
            if name.len() == 64 && !name.contains('_') {
                out.push(name.into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    // Shards that currently hold at least one cache file.
    pub fn list_populated_shards(&self) -> Result<Vec<String>> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(self.root.join(CACHE_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !self.list_cache_by_shard(&name)?.is_empty() {
                    shards.push(name);
                }
            }
        }
        shards.sort();
        Ok(shards)
    }

    fn remove_sidecars(&self, hex: &str) -> Result<()> {
        let dir = self.root.join(CACHE_DIR).join(&hex[..SHARD_PREFIX_LEN]);
        for kind in super::MetadataKind::ALL {
            let path = dir.join(format!("{}{}", hex, kind.suffix()));
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use super::*;

    fn store() -> (tempfile::TempDir, CasStore) {
        let dir = tempfile::tempdir().unwrap();
        let cas = CasStore::new(dir.path()).unwrap();
        (dir, cas)
    }

    fn put(cas: &CasStore, content: &[u8]) -> Digest {
        let digest = Digest::compute(content);
        let uuid = format!("test-{}", digest.shard_id());
        cas.create_upload(&uuid).unwrap();
        cas.open_upload(&uuid).unwrap().write_all(content).unwrap();
        cas.seal(&uuid, &digest).unwrap();
        digest
    }

    #[test]
    fn test_upload_seal_read_back() {
        let (_dir, cas) = store();
        let digest = put(&cas, b"hello");

        let mut buf = Vec::new();
        cas.get_cache(&digest).unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(cas.stat_cache(&digest).unwrap().size, 5);
    }

    #[test]
    fn test_create_upload_twice_is_exists() {
        let (_dir, cas) = store();
        cas.create_upload("u1").unwrap();
        assert!(matches!(cas.create_upload("u1"), Err(FileError::Exists)));
    }

    #[test]
    fn test_seal_duplicate_digest_is_exists() {
        let (_dir, cas) = store();
        let digest = put(&cas, b"dup");

        cas.create_upload("second").unwrap();
        cas.open_upload("second").unwrap().write_all(b"dup").unwrap();
        assert!(matches!(cas.seal("second", &digest), Err(FileError::Exists)));
        // The redundant upload is gone; the cache file survives.
        assert!(matches!(cas.open_upload("second"), Err(FileError::NotFound)));
        assert!(cas.has_cache(&digest));
    }

    #[test]
    fn test_seal_missing_upload_is_not_found() {
        let (_dir, cas) = store();
        let digest = Digest::compute(b"never uploaded");
        assert!(matches!(cas.seal("ghost", &digest), Err(FileError::NotFound)));
    }

    #[test]
    fn test_patch_at_offset() {
        let (_dir, cas) = store();
        cas.create_upload("u").unwrap();
        let mut f = cas.open_upload("u").unwrap();
        f.seek(SeekFrom::Start(3)).unwrap();
        f.write_all(b"def").unwrap();
        let mut f = cas.open_upload("u").unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(b"abc").unwrap();
        assert_eq!(cas.upload_size("u").unwrap(), 6);
    }

    #[test]
    fn test_delete_cache_moves_to_trash() {
        let (dir, cas) = store();
        let digest = put(&cas, b"trash me");
        cas.delete_cache(&digest).unwrap();

        assert!(matches!(cas.get_cache(&digest), Err(FileError::NotFound)));
        let trashed: Vec<_> = fs::read_dir(dir.path().join(TRASH_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(trashed.len(), 1);
        assert!(trashed[0].starts_with(digest.hex()));

        assert!(matches!(cas.delete_cache(&digest), Err(FileError::NotFound)));
    }

    #[test]
    fn test_list_cache_by_shard() {
        let (_dir, cas) = store();
        let digest = put(&cas, b"shard content");
        let listed = cas.list_cache_by_shard(digest.shard_id()).unwrap();
        assert_eq!(listed, vec![digest.hex().to_owned()]);
        assert!(cas.list_cache_by_shard("0000").unwrap().is_empty()
            || digest.shard_id() == "0000");
    }

    #[test]
    fn test_purge_abandoned_uploads() {
        let (_dir, cas) = store();
        cas.create_upload("stale").unwrap();
        // Everything is abandoned when the deadline is zero.
        assert_eq!(cas.purge_abandoned_uploads(Duration::ZERO).unwrap(), 1);
        assert!(matches!(cas.open_upload("stale"), Err(FileError::NotFound)));
    }
}
