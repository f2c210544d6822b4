use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tokio::sync::{mpsc, Semaphore};
use shoal::{store::CasStore, Digest};
use crate::{
    backend::{Backend, BackendError},
    upload::{UploadError, UploadManager},
};

// Outcome of a refresh request. Callers poll on Started/Pending.
#[derive(Debug)]
pub enum RefreshStatus {

    // A worker is now pulling the blob from the backend.
    Started,

    // An identical refresh is already in flight.
    Pending,

    // Every worker slot is taken; back off.
    WorkersBusy,

    // The backend has never seen this blob.
    NotFound,

    Failed(String),

}

// Fired when a refresh lands a blob in the cache, so the server can
// replicate and start seeding it.
#[derive(Debug)]
pub struct RefreshEvent {
    pub namespace: String,
    pub digest: Digest,
}

pub type RefreshEventRx = mpsc::UnboundedReceiver<RefreshEvent>;

// De-duplicates concurrent backend pulls: at most one in-flight worker
// per (namespace, digest), bounded by a worker pool.
#[derive(Clone)]
pub struct Refresher {

    cas: Arc<CasStore>,

    backend: Arc<dyn Backend>,

    uploads: UploadManager,

    workers: Arc<Semaphore>,

    // Keys currently being pulled.
    inflight: Arc<Mutex<HashSet<(String, String)>>>,

    events_tx: mpsc::UnboundedSender<RefreshEvent>,

}

impl Refresher {

    pub fn new(
        cas: Arc<CasStore>,
        backend: Arc<dyn Backend>,
        uploads: UploadManager,
        workers: usize,
    ) -> (Self, RefreshEventRx) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Refresher {
                cas,
                backend,
                uploads,
                workers: Arc::new(Semaphore::new(workers)),
                inflight: Arc::new(Mutex::new(HashSet::new())),
                events_tx,
            },
            events_rx,
        )
    }

    pub async fn refresh(&self, namespace: &str, digest: &Digest) -> RefreshStatus {

        let key = (namespace.to_owned(), digest.hex().to_owned());
        {
            let mut inflight = self.inflight.lock().expect("refresher lock poisoned");
            if inflight.contains(&key) {
                return RefreshStatus::Pending;
            }
            // Claimed below only after the cheap checks pass, but mark
            // now so concurrent callers collapse onto this attempt.
            inflight.insert(key.clone());
        }

        // Authoritative miss if the backend has never seen the blob.
        match self.backend.stat(namespace, digest).await {
            Ok(_) => {}
            Err(BackendError::NotFound) => {
                self.clear(&key);
                return RefreshStatus::NotFound;
            }
            Err(e) => {
                self.clear(&key);
                return RefreshStatus::Failed(e.to_string());
            }
        }

        let permit = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.clear(&key);
                return RefreshStatus::WorkersBusy;
            }
        };

        let refresher = self.clone();
        let namespace = namespace.to_owned();
        let digest = digest.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = refresher.pull(&namespace, &digest).await {
                tracing::error!("refresh of {} failed: {}", digest, e);
            }
            refresher.clear(&(namespace.clone(), digest.hex().to_owned()));
        });

        RefreshStatus::Started
    }

    fn clear(&self, key: &(String, String)) {
        self.inflight.lock().expect("refresher lock poisoned").remove(key);
    }

    // Backend -> upload file -> verified seal -> metainfo -> event.
    async fn pull(&self, namespace: &str, digest: &Digest) -> Result<(), String> {

        if self.cas.has_cache(digest) {
            return Ok(());
        }
        tracing::info!("refreshing {} from backend", digest);

        let uid = uuid::Uuid::new_v4().to_string();
        self.cas.create_upload(&uid).map_err(|e| e.to_string())?;
        let mut file = self.cas.open_upload(&uid).map_err(|e| e.to_string())?;

        if let Err(e) = self.backend.download(namespace, digest, &mut file).await {
            let _ = self.cas.delete_upload(&uid);
            return Err(e.to_string());
        }
        drop(file);

        // Commit verifies the SHA-256, so a corrupt backend read can
        // never be sealed under this digest.
        match self.uploads.commit(digest, &uid) {
            Ok(_) | Err(UploadError::Conflict) => {}
            Err(e) => return Err(e.to_string()),
        }

        self.events_tx
            .send(RefreshEvent {
                namespace: namespace.to_owned(),
                digest: digest.clone(),
            })
            .ok();
        Ok(())
    }
}
