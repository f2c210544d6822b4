use std::time::Duration;
use rand::Rng;
use tokio::time;
use shoal::{Digest, MetaInfo};
use crate::client::{ClientError, MetaInfoStatus, OriginClient, Result};

const POLL_INITIAL_DELAY: Duration = Duration::from_millis(100);
const POLL_MAX_DELAY: Duration = Duration::from_secs(2);

// Client-side view of the whole origin cluster: resolves the owning
// origins for a digest through any reachable bootstrap origin, then
// retries operations across the replica set in order.
#[derive(Debug, Clone)]
pub struct ClusterClient {

    // Bootstrap addresses; any healthy one can answer locations.
    origins: Vec<String>,

}

impl ClusterClient {

    pub fn new(origins: Vec<String>) -> Self {
        ClusterClient { origins }
    }

    // The owning origins for a digest, asked of each bootstrap origin in
    // turn until one answers.
    pub async fn locations(&self, digest: &Digest) -> Result<Vec<String>> {
        let mut last = ClientError::NotFound;
        for addr in &self.origins {
            match OriginClient::new(addr.clone()).locations(digest).await {
                Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                Ok(_) => last = ClientError::NotFound,
                Err(e) => {
                    tracing::warn!("locations from {} failed: {}", addr, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    pub async fn check_blob(&self, namespace: &str, digest: &Digest) -> Result<bool> {
        self.with_owners(digest, |client| {
            let namespace = namespace.to_owned();
            let digest = digest.clone();
            async move { client.check(&namespace, &digest).await }
        })
        .await
    }

    // Push with Conflict-as-success semantics, trying owners in order.
    pub async fn push_blob(&self, namespace: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        self.with_owners(digest, |client| {
            let namespace = namespace.to_owned();
            let digest = digest.clone();
            let data = data.to_vec();
            async move { client.push_blob(&namespace, &digest, &data).await }
        })
        .await
    }

    // Download, polling through Accepted (backend refresh) until the
    // deadline.
    pub async fn download_blob(
        &self,
        namespace: &str,
        digest: &Digest,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = time::Instant::now() + timeout;
        let mut delay = POLL_INITIAL_DELAY;

        loop {
            let attempt = self.with_owners(digest, |client| {
                let namespace = namespace.to_owned();
                let digest = digest.clone();
                async move { client.download(&namespace, &digest).await }
            })
            .await;

            match attempt {
                Err(ClientError::Accepted) => {
                    delay = sleep_backoff(delay, deadline).await.ok_or(ClientError::Timeout)?;
                }
                other => return other,
            }
        }
    }

    pub async fn get_metainfo(
        &self,
        namespace: &str,
        digest: &Digest,
        timeout: Duration,
    ) -> Result<MetaInfo> {
        let deadline = time::Instant::now() + timeout;
        let mut delay = POLL_INITIAL_DELAY;

        loop {
            let attempt = self.with_owners(digest, |client| {
                let namespace = namespace.to_owned();
                let digest = digest.clone();
                async move { client.get_metainfo(&namespace, &digest).await }
            })
            .await;

            match attempt {
                Ok(MetaInfoStatus::Ready(metainfo)) => return Ok(metainfo),
                Ok(MetaInfoStatus::Pending) | Err(ClientError::Accepted) => {
                    delay = sleep_backoff(delay, deadline).await.ok_or(ClientError::Timeout)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Resolve owners and run op against each in order until one
    // answers. A 307 re-points the owner list mid-flight.
    async fn with_owners<T, F, Fut>(&self, digest: &Digest, op: F) -> Result<T>
    where
        F: Fn(OriginClient) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut owners = self.locations(digest).await?;
        let mut last = ClientError::NotFound;

        let mut hops = 0;
        while hops < 2 {
            for addr in &owners {
                match op(OriginClient::new(addr.clone())).await {
                    Ok(v) => return Ok(v),
                    Err(ClientError::Redirect(addrs)) if !addrs.is_empty() => {
                        // Stale view of the ring; chase the hint once.
                        tracing::debug!("redirected from {} to {:?}", addr, addrs);
                        owners = addrs;
                        last = ClientError::NotFound;
                        break;
                    }
                    Err(ClientError::Network(e)) => {
                        tracing::warn!("origin {} unreachable: {}", addr, e);
                        last = ClientError::Network(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            hops += 1;
        }
        Err(last)
    }
}

// Jittered exponential backoff step; None once the deadline would pass.
async fn sleep_backoff(delay: Duration, deadline: time::Instant) -> Option<Duration> {
    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
    let sleep = delay + Duration::from_millis(jitter);
    if time::Instant::now() + sleep >= deadline {
        return None;
    }
    time::sleep(sleep).await;
    Some((delay * 2).min(POLL_MAX_DELAY))
}
