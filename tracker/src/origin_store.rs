use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use dashmap::DashMap;
use tokio::sync::Mutex;
use origin::{ClusterClient, OriginClient};
use shoal::{announce::HandoutPeer, Digest, PeerContext};
use crate::config::TrackerConfig;

#[derive(Debug, thiserror::Error)]
pub enum OriginStoreError {

    // Every origin for the digest is currently unreachable; the tracker
    // degrades to peer-only handouts.
    #[error("all origins unavailable")]
    AllUnavailable,
}

// A cached lookup: either value or error string, each with its own TTL.
#[derive(Clone)]
struct CachedResult<T> {
    value: Result<T, String>,
    expires: Instant,
}

impl<T: Clone> CachedResult<T> {
    fn fresh(&self) -> Option<Result<T, String>> {
        (Instant::now() < self.expires).then(|| self.value.clone())
    }
}

// Caches origin-cluster location lookups and per-origin peer contexts
// with differentiated TTLs, so announces stay fast even when parts of
// the origin cluster are down. Lookups are single-flight per key: the
// N-th concurrent miss shares one upstream call.
pub struct OriginStore {

    cluster: ClusterClient,

    locations: DashMap<String, CachedResult<Vec<String>>>,

    contexts: DashMap<String, CachedResult<PeerContext>>,

    // Per-key guards serializing upstream fetches.
    location_flights: DashMap<String, Arc<Mutex<()>>>,

    context_flights: DashMap<String, Arc<Mutex<()>>>,

    config: TrackerConfig,

}

impl OriginStore {

    pub fn new(config: TrackerConfig) -> Self {
        OriginStore {
            cluster: ClusterClient::new(config.origins.clone()),
            locations: DashMap::new(),
            contexts: DashMap::new(),
            location_flights: DashMap::new(),
            context_flights: DashMap::new(),
            config,
        }
    }

    // Origin seeders for a digest: resolve locations, then each
    // origin's peer context, dropping origins that are currently
    // erroring. Origins always report complete.
    pub async fn get_origins(&self, digest: &Digest) -> Result<Vec<HandoutPeer>, OriginStoreError> {

        let addrs = match self.get_locations(digest).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!("locations for {} unavailable: {}", digest, e);
                return Err(OriginStoreError::AllUnavailable);
            }
        };

        let mut origins = Vec::new();
        for addr in addrs {
            match self.get_context(&addr).await {
                Ok(ctx) => origins.push(HandoutPeer { ctx, complete: true }),
                Err(e) => {
                    tracing::warn!("origin {} unavailable: {}", addr, e);
                }
            }
        }

        if origins.is_empty() {
            return Err(OriginStoreError::AllUnavailable);
        }
        Ok(origins)
    }

    pub async fn get_locations(&self, digest: &Digest) -> Result<Vec<String>, String> {

        let key = digest.hex().to_owned();
        if let Some(cached) = self.locations.get(&key).and_then(|e| e.fresh()) {
            return cached;
        }

        let flight = self.location_flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = flight.lock().await;

        // Someone else may have populated the cache while we waited.
        if let Some(cached) = self.locations.get(&key).and_then(|e| e.fresh()) {
            return cached;
        }

        let value = self.cluster
            .locations(digest)
            .await
            .map_err(|e| e.to_string());
        let ttl = match &value {
            Ok(_) => self.config.locations_ttl(),
            Err(_) => self.config.locations_error_ttl(),
        };
        self.locations.insert(key.clone(), CachedResult {
            value: value.clone(),
            expires: Instant::now() + ttl,
        });
        self.location_flights.remove(&key);
        value
    }

    pub async fn get_context(&self, addr: &str) -> Result<PeerContext, String> {

        if let Some(cached) = self.contexts.get(addr).and_then(|e| e.fresh()) {
            return cached;
        }

        let flight = self.context_flights
            .entry(addr.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = flight.lock().await;

        if let Some(cached) = self.contexts.get(addr).and_then(|e| e.fresh()) {
            return cached;
        }

        let value = OriginClient::new(addr)
            .peer_context()
            .await
            .map_err(|e| e.to_string());
        let ttl = match &value {
            Ok(_) => self.config.origin_context_ttl(),
            Err(_) => self.config.origin_unavailable_ttl(),
        };
        self.contexts.insert(addr.to_owned(), CachedResult {
            value: value.clone(),
            expires: Instant::now() + ttl,
        });
        self.context_flights.remove(addr);
        value
    }

    // Test hook: preload a context as if fetched, honoring TTL logic.
    #[cfg(test)]
    pub(crate) fn prime_context(&self, addr: &str, value: Result<PeerContext, String>) {
        let ttl = match &value {
            Ok(_) => self.config.origin_context_ttl(),
            Err(_) => self.config.origin_unavailable_ttl(),
        };
        self.contexts.insert(addr.to_owned(), CachedResult {
            value,
            expires: Instant::now() + ttl,
        });
    }

    #[cfg(test)]
    pub(crate) fn prime_locations(&self, digest: &Digest, value: Result<Vec<String>, String>) {
        let ttl = match &value {
            Ok(_) => self.config.locations_ttl(),
            Err(_) => self.config.locations_error_ttl(),
        };
        self.locations.insert(digest.hex().to_owned(), CachedResult {
            value,
            expires: Instant::now() + ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use shoal::PeerId;
    use super::*;

    fn store() -> OriginStore {
        OriginStore::new(TrackerConfig::default())
    }

    fn origin_ctx(ip: &str) -> PeerContext {
        PeerContext {
            peer_id: PeerId::random(),
            ip: ip.parse().unwrap(),
            port: 16001,
            origin: true,
            zone: String::new(),
        }
    }

    #[tokio::test]
    async fn test_origins_skip_unavailable_members() {
        let store = store();
        let digest = Digest::compute(b"blob");
        store.prime_locations(&digest, Ok(vec!["a:15002".into(), "b:15002".into()]));
        store.prime_context("a:15002", Ok(origin_ctx("10.0.0.1")));
        store.prime_context("b:15002", Err("connection refused".into()));

        let origins = store.get_origins(&digest).await.unwrap();
        assert_eq!(origins.len(), 1);
        assert!(origins[0].ctx.origin);
        assert!(origins[0].complete);
    }

    #[tokio::test]
    async fn test_all_unavailable() {
        let store = store();
        let digest = Digest::compute(b"blob");
        store.prime_locations(&digest, Ok(vec!["a:15002".into()]));
        store.prime_context("a:15002", Err("connection refused".into()));

        assert!(matches!(
            store.get_origins(&digest).await,
            Err(OriginStoreError::AllUnavailable),
        ));
    }

    #[tokio::test]
    async fn test_location_errors_are_cached() {
        let store = store();
        let digest = Digest::compute(b"blob");
        store.prime_locations(&digest, Err("boom".into()));
        // Served from the error cache without touching the cluster.
        assert!(store.get_locations(&digest).await.is_err());
    }
}
