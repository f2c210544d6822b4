use std::{
    fs,
    io::{Read, Write},
    path::PathBuf,
};
use async_trait::async_trait;
use shoal::Digest;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {

    #[error("blob not found in backend")]
    NotFound,

    #[error("blob already exists in backend")]
    Exists,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("backend network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

// Capability set of the remote object store above the origin cluster.
// Components depend on this, never on a concrete backend.
#[async_trait]
pub trait Backend: Send + Sync {

    // Size of the blob, NotFound if the backend has never seen it.
    async fn stat(&self, namespace: &str, digest: &Digest) -> Result<u64>;

    // Stream the blob into sink; returns the byte count.
    async fn download(
        &self,
        namespace: &str,
        digest: &Digest,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64>;

    // Write-back. Exists means another replica won the race, which
    // callers treat as done.
    async fn upload(
        &self,
        namespace: &str,
        digest: &Digest,
        source: &mut (dyn Read + Send),
    ) -> Result<()>;
}

// Filesystem-backed object store, one directory per namespace. Stands in
// for the real remote store in deployments without one and in tests.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {

    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FsBackend { root: root.into() }
    }

    fn blob_path(&self, namespace: &str, digest: &Digest) -> PathBuf {
        self.root.join(namespace).join(digest.hex())
    }

    fn map_io(e: std::io::Error) -> BackendError {
        match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound,
            _ => BackendError::Io(e),
        }
    }

    // Test/bootstrap helper: put a blob straight into the backend.
    pub fn put(&self, namespace: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(namespace, digest);
        fs::create_dir_all(path.parent().expect("blob path has parent"))?;
        fs::write(path, data)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for FsBackend {

    async fn stat(&self, namespace: &str, digest: &Digest) -> Result<u64> {
        fs::metadata(self.blob_path(namespace, digest))
            .map(|m| m.len())
            .map_err(Self::map_io)
    }

    async fn download(
        &self,
        namespace: &str,
        digest: &Digest,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64> {
        let mut file = fs::File::open(self.blob_path(namespace, digest)).map_err(Self::map_io)?;
        Ok(std::io::copy(&mut file, sink)?)
    }

    async fn upload(
        &self,
        namespace: &str,
        digest: &Digest,
        source: &mut (dyn Read + Send),
    ) -> Result<()> {
        let path = self.blob_path(namespace, digest);
        if path.exists() {
            return Err(BackendError::Exists);
        }
        fs::create_dir_all(path.parent().expect("blob path has parent"))?;

        // Write to the side, rename in, so a crashed upload never leaves
        // a torn blob visible.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp)?;
        std::io::copy(source, &mut file)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
