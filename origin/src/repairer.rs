use std::{sync::Arc, time::Duration};
use futures::StreamExt;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;
use shoal::Digest;
use crate::{client::OriginClient, server::OriginState};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

// One line of the append-only repair progress stream. Consumers use
// these both for observability and to decide whether a retry is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {

    // "replicate_digest" or "delete_digest".
    pub operation: String,

    pub digest: String,

    // Target origin for replications; None for local deletes.
    pub host: Option<String>,

    pub success: bool,

    pub error: Option<String>,

    pub at: chrono::DateTime<chrono::Utc>,

}

impl ProgressRecord {

    fn replicate(digest: &Digest, host: &str, error: Option<String>) -> Self {
        ProgressRecord {
            operation: "replicate_digest".to_owned(),
            digest: digest.to_string(),
            host: Some(host.to_owned()),
            success: error.is_none(),
            error,
            at: chrono::Utc::now(),
        }
    }

    fn delete(digest: &Digest, error: Option<String>) -> Self {
        ProgressRecord {
            operation: "delete_digest".to_owned(),
            digest: digest.to_string(),
            host: None,
            success: error.is_none(),
            error,
            at: chrono::Utc::now(),
        }
    }
}

// Brings replica sets back into line with the current hash ring: pushes
// every locally cached digest to the origins that should own it, and
// trashes the local copy once this origin is no longer an owner.
// Failures become records, not aborts; other digests keep going.
pub(crate) struct Repairer {

    state: Arc<OriginState>,

    records: mpsc::UnboundedSender<ProgressRecord>,

}

impl Repairer {

    pub fn new(state: Arc<OriginState>, records: mpsc::UnboundedSender<ProgressRecord>) -> Self {
        Repairer { state, records }
    }

    pub async fn repair_all(&self) {
        let shards = match self.state.cas.list_populated_shards() {
            Ok(shards) => shards,
            Err(e) => {
                tracing::error!("listing shards for repair failed: {}", e);
                return;
            }
        };
        for shard in shards {
            self.repair_shard(&shard).await;
        }
    }

    pub async fn repair_shard(&self, shard_id: &str) {
        let digests = match self.state.cas.list_cache_by_shard(shard_id) {
            Ok(digests) => digests,
            Err(e) => {
                tracing::error!("listing shard {} for repair failed: {}", shard_id, e);
                return;
            }
        };
        tracing::info!("repairing shard {}: {} digests", shard_id, digests.len());
        for hex in digests {
            match Digest::from_hex(&hex) {
                Ok(digest) => self.repair_digest(&digest).await,
                Err(e) => tracing::error!("skipping malformed cache name {}: {}", hex, e),
            }
        }
    }

    #[tracing::instrument(skip(self), name = "repair", fields(digest = %digest))]
    pub async fn repair_digest(&self, digest: &Digest) {

        let mut desired = self.state.ring.ordered(digest.shard_id());
        desired.truncate(self.state.ring.num_replica());

        let own_label = &self.state.config.label;
        let purge = !desired.iter().any(|n| n.label == *own_label);
        let hosts: Vec<(String, String)> = desired
            .iter()
            .filter(|n| n.label != *own_label)
            .map(|n| (n.label.clone(), n.addr.clone()))
            .collect();

        let mut file = match self.state.cas.get_cache(digest) {
            Ok(file) => file,
            // Nothing local to repair.
            Err(_) => return,
        };
        let mut data = Vec::new();
        if let Err(e) = std::io::Read::read_to_end(&mut file, &mut data) {
            tracing::error!("reading {} for repair failed: {}", digest, e);
            return;
        }
        drop(file);

        let workers = self.state.config.repair.workers.max(1);
        let outcomes: Vec<bool> = futures::stream::iter(hosts)
            .map(|(label, addr)| {
                let data = &data;
                async move {
                    let error = self.transfer_with_retry(&addr, digest, data).await.err();
                    if let Some(e) = &error {
                        tracing::warn!("repair transfer of {} to {} failed: {}", digest, label, e);
                    }
                    let ok = error.is_none();
                    self.records
                        .send(ProgressRecord::replicate(digest, &addr, error))
                        .ok();
                    ok
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        if !purge {
            return;
        }
        if !outcomes.iter().all(|ok| *ok) {
            // A replica is missing the blob; keep our copy until a later
            // repair finishes the job.
            tracing::warn!("not purging {}: unfinished transfers", digest);
            return;
        }

        let error = self.state.cas.delete_cache(digest).err().map(|e| e.to_string());
        if let Some(e) = &error {
            tracing::error!("purging {} failed: {}", digest, e);
        }
        self.records.send(ProgressRecord::delete(digest, error)).ok();
    }

    // Exponential backoff bounded by the repair config; already-exists
    // on the receiver counts as success.
    async fn transfer_with_retry(
        &self,
        addr: &str,
        digest: &Digest,
        data: &[u8],
    ) -> Result<(), String> {

        let cfg = &self.state.config.repair;
        let max_delay = Duration::from_millis(cfg.max_retry_delay_ms);
        let client = OriginClient::new(addr);
        let mut delay = RETRY_BASE_DELAY;

        for attempt in 0..=cfg.max_retries {
            match client.transfer_blob(digest, data).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt == cfg.max_retries => return Err(e.to_string()),
                Err(e) => {
                    tracing::debug!(
                        "transfer attempt {} to {} failed: {}, retrying",
                        attempt + 1,
                        addr,
                        e,
                    );
                }
            }
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
            delay = (delay * 2).min(max_delay);
        }
        unreachable!("retry loop returns before running out of attempts")
    }
}
