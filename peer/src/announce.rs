use std::time::Duration;
use rand::Rng;
use tokio::time;
use shoal::{
    announce::{AnnounceRequest, AnnounceResponse},
    Digest, MetaInfo, MetaInfoError,
};

// Poll backoff for metainfo that is still being refreshed by an origin.
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(100);
const POLL_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {

    #[error("tracker network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("tracker has no peers available")]
    NoPeers,

    #[error("blob not found")]
    NotFound,

    #[error("metainfo poll timed out")]
    Timeout,

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("unexpected tracker status: {0}")]
    Status(u16),
}

pub type Result<T> = std::result::Result<T, AnnounceError>;

#[derive(Debug)]
pub enum MetaInfoStatus {

    Ready(MetaInfo),

    // The origin is refreshing the blob; poll again.
    Pending,

}

// HTTP client for the tracker: JSON announces plus metainfo lookups
// that understand the origin cluster's poll-again semantics.
#[derive(Debug, Clone)]
pub struct AnnounceClient {

    http: reqwest::Client,

    base: String,

}

impl AnnounceClient {

    pub fn new(base: String) -> Self {
        AnnounceClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            base: base.trim_end_matches('/').to_owned(),
        }
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {

        let url = format!("{}/announce/{}", self.base, request.info_hash);
        tracing::debug!("announce url: {}", url);

        let response = self.http.post(url).json(request).send().await?;
        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            404 => Err(AnnounceError::NoPeers),
            status => Err(AnnounceError::Status(status)),
        }
    }

    pub async fn get_metainfo(&self, namespace: &str, digest: &Digest) -> Result<MetaInfoStatus> {

        let url = format!(
            "{}/namespace/{}/blobs/{}/metainfo",
            self.base, namespace, digest,
        );

        let response = self.http.get(url).send().await?;
        match response.status().as_u16() {
            200 => {
                let body = response.bytes().await?;
                Ok(MetaInfoStatus::Ready(MetaInfo::from_bytes(&body)?))
            }
            202 => Ok(MetaInfoStatus::Pending),
            404 => Err(AnnounceError::NotFound),
            status => Err(AnnounceError::Status(status)),
        }
    }

    // Poll with jittered exponential backoff until the origin refresh
    // finishes or the hard deadline passes.
    pub async fn poll_metainfo(
        &self,
        namespace: &str,
        digest: &Digest,
        timeout: Duration,
    ) -> Result<MetaInfo> {

        let deadline = time::Instant::now() + timeout;
        let mut delay = POLL_INITIAL_DELAY;

        loop {
            match self.get_metainfo(namespace, digest).await {
                Ok(MetaInfoStatus::Ready(metainfo)) => return Ok(metainfo),
                Ok(MetaInfoStatus::Pending) => {
                    tracing::debug!("metainfo for {} pending, polling again", digest);
                }
                Err(AnnounceError::Network(e)) => {
                    // The tracker may be mid-restart; keep polling.
                    tracing::warn!("metainfo poll network error: {}", e);
                }
                Err(e) => return Err(e),
            }

            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            let sleep = delay + Duration::from_millis(jitter);
            if time::Instant::now() + sleep >= deadline {
                return Err(AnnounceError::Timeout);
            }
            time::sleep(sleep).await;
            delay = (delay * 2).min(POLL_MAX_DELAY);
        }
    }
}
