use std::time::Duration;
use shoal::{Digest, MetaInfo, MetaInfoError, PeerContext};

// Chunk size for blob pushes between origins.
pub(crate) const TRANSFER_CHUNK: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {

    #[error("origin network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("not found")]
    NotFound,

    #[error("digest already exists")]
    Conflict,

    // Asynchronous work in progress; poll again.
    #[error("accepted, retry later")]
    Accepted,

    #[error("origin workers busy")]
    WorkersBusy,

    // Sent to a non-owning origin; retry against these addresses.
    #[error("redirected to {0:?}")]
    Redirect(Vec<String>),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("missing Location header on upload start")]
    NoUploadLocation,

    #[error("metainfo poll timed out")]
    Timeout,

    #[error("unexpected origin status: {0}")]
    Status(u16),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug)]
pub enum MetaInfoStatus {

    Ready(MetaInfo),

    // The origin kicked off a backend refresh; poll again.
    Pending,

}

// HTTP client for a single origin server, public and internal surfaces.
#[derive(Debug, Clone)]
pub struct OriginClient {

    http: reqwest::Client,

    // host:port of the origin.
    addr: String,

}

impl OriginClient {

    pub fn new<S: Into<String>>(addr: S) -> Self {
        OriginClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                // Redirects carry routing information; never follow.
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client"),
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    // Map the wire status codes onto first-class outcomes.
    async fn unexpected(response: reqwest::Response) -> ClientError {
        match response.status().as_u16() {
            404 => ClientError::NotFound,
            409 => ClientError::Conflict,
            202 => ClientError::Accepted,
            503 => ClientError::WorkersBusy,
            307 => ClientError::Redirect(parse_locations(&response)),
            400 => {
                let body = response.text().await.unwrap_or_default();
                ClientError::BadRequest(body)
            }
            status => ClientError::Status(status),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.http.get(self.url("/health")).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn locations(&self, digest: &Digest) -> Result<Vec<String>> {
        let response = self.http
            .get(self.url(&format!("/blobs/{}/locations", digest)))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(parse_locations(&response))
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn check(&self, namespace: &str, digest: &Digest) -> Result<bool> {
        let response = self.http
            .head(self.url(&format!("/internal/namespace/{}/blobs/{}", namespace, digest)))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::unexpected(response).await),
        }
    }

    pub async fn download(&self, namespace: &str, digest: &Digest) -> Result<Vec<u8>> {
        let response = self.http
            .get(self.url(&format!("/namespace/{}/blobs/{}", namespace, digest)))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.bytes().await?.to_vec())
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn get_metainfo(&self, namespace: &str, digest: &Digest) -> Result<MetaInfoStatus> {
        let response = self.http
            .get(self.url(&format!("/internal/namespace/{}/blobs/{}/metainfo", namespace, digest)))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(MetaInfoStatus::Ready(MetaInfo::from_bytes(&response.bytes().await?)?)),
            202 => Ok(MetaInfoStatus::Pending),
            _ => Err(Self::unexpected(response).await),
        }
    }

    pub async fn peer_context(&self) -> Result<PeerContext> {
        let response = self.http.get(self.url("/internal/peercontext")).send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    // Public chunked upload. Conflict anywhere means the cluster already
    // has the blob, which is success for the pusher.
    pub async fn push_blob(&self, namespace: &str, digest: &Digest, data: &[u8]) -> Result<()> {
        let base = format!("/namespace/{}/blobs/{}/uploads", namespace, digest);
        match self.push_inner(&base, data).await {
            Ok(_) | Err(ClientError::Conflict) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // Internal origin-to-origin copy: same triad, no backend write-back
    // on the receiving side. Returns the upload id when bytes moved,
    // None when the receiver already had the blob.
    pub async fn transfer_blob(&self, digest: &Digest, data: &[u8]) -> Result<Option<String>> {
        let base = format!("/internal/blobs/{}/uploads", digest);
        match self.push_inner(&base, data).await {
            Ok(uid) => Ok(Some(uid)),
            Err(ClientError::Conflict) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn push_inner(&self, base: &str, data: &[u8]) -> Result<String> {

        let response = self.http.post(self.url(base)).send().await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }
        let uid = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(ClientError::NoUploadLocation)?;

        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + TRANSFER_CHUNK).min(data.len());
            let response = self.http
                .patch(self.url(&format!("{}/{}", base, uid)))
                .header("Content-Range", format!("{}-{}", offset, end))
                .body(data[offset..end].to_vec())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(Self::unexpected(response).await);
            }
            offset = end;
        }

        let response = self.http.put(self.url(&format!("{}/{}", base, uid))).send().await?;
        if response.status().is_success() {
            Ok(uid)
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn duplicate_writeback(
        &self,
        namespace: &str,
        digest: &Digest,
        uid: &str,
        delay: Duration,
    ) -> Result<()> {
        let response = self.http
            .put(self.url(&format!(
                "/internal/duplicate/namespace/{}/blobs/{}/uploads/{}",
                namespace, digest, uid,
            )))
            .json(&serde_json::json!({ "delay_ms": delay.as_millis() as u64 }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn delete_blob(&self, digest: &Digest) -> Result<()> {
        let response = self.http
            .delete(self.url(&format!("/internal/blobs/{}", digest)))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn overwrite_metainfo(&self, digest: &Digest, piece_length: u64) -> Result<MetaInfo> {
        let response = self.http
            .post(self.url(&format!(
                "/internal/blobs/{}/metainfo?piece_length={}",
                digest, piece_length,
            )))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(MetaInfo::from_bytes(&response.bytes().await?)?)
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    pub async fn replicate_remote(
        &self,
        namespace: &str,
        digest: &Digest,
        remote_dns: &str,
    ) -> Result<()> {
        let response = self.http
            .post(self.url(&format!(
                "/namespace/{}/blobs/{}/remote/{}",
                namespace, digest, remote_dns,
            )))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(response).await)
        }
    }

    // Repair endpoints stream JSON progress records; callers get the
    // raw line stream.
    pub async fn repair_shard(&self, shard_id: &str) -> Result<String> {
        self.repair(&format!("/internal/repair/shard/{}", shard_id)).await
    }

    pub async fn repair_digest(&self, digest: &Digest) -> Result<String> {
        self.repair(&format!("/internal/repair/digest/{}", digest)).await
    }

    pub async fn repair_all(&self) -> Result<String> {
        self.repair("/internal/repair").await
    }

    async fn repair(&self, path: &str) -> Result<String> {
        let response = self.http
            .post(self.url(path))
            // Repairs move real data; give them room.
            .timeout(Duration::from_secs(600))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.text().await?)
        } else {
            Err(Self::unexpected(response).await)
        }
    }
}

fn parse_locations(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get("Origin-Locations")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_format_matches_server() {
        // Content-Range is "start-end", end exclusive; the chunking loop
        // must produce contiguous, length-matching ranges.
        let data = vec![0u8; TRANSFER_CHUNK * 2 + 17];
        let mut ranges = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + TRANSFER_CHUNK).min(data.len());
            ranges.push((offset, end));
            offset = end;
        }
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (0, TRANSFER_CHUNK));
        assert_eq!(ranges[2].1, data.len());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }
}
