use std::{io::Read, sync::Arc, time::Duration};
use shoal::Digest;
use crate::{backend::BackendError, client::OriginClient, server::OriginState};

fn read_blob(state: &OriginState, digest: &Digest) -> Option<Vec<u8>> {
    let mut file = match state.cas.get_cache(digest) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("blob {} unreadable for replication: {}", digest, e);
            return None;
        }
    };
    let mut buf = Vec::new();
    if let Err(e) = file.read_to_end(&mut buf) {
        tracing::warn!("blob {} unreadable for replication: {}", digest, e);
        return None;
    }
    Some(buf)
}

// After a commit (or refresh): push the blob to every co-owner replica.
// With write-back on, each receiver also gets a staggered duplicate
// write-back task so exactly one replica usually hits the backend.
// Individual failures are logged, never surfaced: repair reconciles.
pub(crate) fn replicate_to_replicas(
    state: Arc<OriginState>,
    namespace: String,
    digest: Digest,
    with_writeback: bool,
) {
    tokio::spawn(async move {

        let Some(data) = read_blob(&state, &digest) else { return };

        let others: Vec<(String, String)> = state.ring
            .replicas(&digest)
            .iter()
            .filter(|n| n.label != state.config.label)
            .map(|n| (n.label.clone(), n.addr.clone()))
            .collect();

        for (i, (label, addr)) in others.into_iter().enumerate() {
            let client = OriginClient::new(addr);
            match client.transfer_blob(&digest, &data).await {
                Ok(Some(uid)) if with_writeback => {
                    // Stagger index 0 is ours (scheduled at commit).
                    let delay = state.config.writeback_stagger() * (i as u32 + 1);
                    if let Err(e) = client
                        .duplicate_writeback(&namespace, &digest, &uid, delay)
                        .await
                    {
                        tracing::warn!("duplicate write-back to {} failed: {}", label, e);
                    }
                }
                Ok(Some(_)) => {
                    tracing::debug!("replicated {} to {}", digest, label);
                }
                Ok(None) => {
                    tracing::debug!("{} already had {}", label, digest);
                }
                Err(e) => {
                    tracing::warn!("replication of {} to {} failed: {}", digest, label, e);
                }
            }
        }
    });
}

// Delayed write-back of a cached blob into the backend. The first
// replica to fire wins; the rest observe Exists and drop their task.
pub(crate) fn schedule_writeback(
    state: Arc<OriginState>,
    namespace: String,
    digest: Digest,
    delay: Duration,
) {
    tokio::spawn(async move {

        tokio::time::sleep(delay).await;

        let Some(data) = read_blob(&state, &digest) else {
            tracing::debug!("{} gone before write-back, dropping task", digest);
            return;
        };

        match state.backend.upload(&namespace, &digest, &mut &data[..]).await {
            Ok(()) => {
                tracing::info!("wrote {} back to backend", digest);
                state.uploads.clear_persist(&digest).ok();
            }
            Err(BackendError::Exists) => {
                tracing::debug!("another replica wrote {} back first", digest);
                state.uploads.clear_persist(&digest).ok();
            }
            Err(e) => {
                tracing::error!("write-back of {} failed: {}", digest, e);
            }
        }
    });
}
