use serde_derive::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use crate::digest::Digest;

// One origin in the ring. Weight scales the fraction of shards the node
// owns; weight 0 takes it out of every replica set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RingNode {

    // Stable identity used for scoring and routing decisions.
    pub label: String,

    // host:port the node answers on.
    pub addr: String,

    pub weight: u32,

}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RingConfig {

    pub nodes: Vec<RingNode>,

    // Length of the replica set prefix per shard.
    pub num_replica: usize,

}

// Weighted highest-random-weight (rendezvous) ring. Fully deterministic
// from config; every node computes identical orderings with no
// coordination.
#[derive(Debug, Clone)]
pub struct HashRing {
    config: RingConfig,
}

impl HashRing {

    pub fn new(config: RingConfig) -> Self {
        HashRing { config }
    }

    pub fn num_replica(&self) -> usize {
        self.config.num_replica
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.config.nodes
    }

    pub fn node(&self, label: &str) -> Option<&RingNode> {
        self.config.nodes.iter().find(|n| n.label == label)
    }

    // All nodes in rendezvous order for a shard. The first num_replica
    // entries are the shard's replica set.
    pub fn ordered(&self, shard_id: &str) -> Vec<&RingNode> {
        let mut scored: Vec<(f64, &RingNode)> = self.config.nodes
            .iter()
            .map(|n| (score(&n.label, shard_id, n.weight), n))
            .collect();
        // Exponential-arrival scores: the smallest wins. Ties (equal
        // scores, e.g. two zero-weight nodes) break on label.
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.label.cmp(&b.1.label))
        });
        scored.into_iter().map(|(_, n)| n).collect()
    }

    pub fn replicas(&self, digest: &Digest) -> Vec<&RingNode> {
        let mut ordered = self.ordered(digest.shard_id());
        ordered.truncate(self.config.num_replica);
        ordered
    }

    // Replica addresses, lexicographically sorted for stable headers.
    pub fn locations(&self, digest: &Digest) -> Vec<String> {
        let mut addrs: Vec<String> = self.replicas(digest)
            .iter()
            .map(|n| n.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    pub fn owns(&self, label: &str, digest: &Digest) -> bool {
        self.replicas(digest).iter().any(|n| n.label == label)
    }
}

// Rendezvous score for (node, shard): a uniform draw in (0, 1) seeded by
// the pair, stretched by -ln(u) / weight. Smaller is closer. Zero weight
// scores infinity and loses to every weighted node.
fn score(label: &str, shard_id: &str, weight: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update(shard_id.as_bytes());
    let out = hasher.finalize();
    let h = u64::from_be_bytes(out[..8].try_into().unwrap());

    // Map to (0, 1) exclusive so ln never sees zero.
    let u = (h as f64 + 1.0) / (u64::MAX as f64 + 2.0);
    if weight == 0 {
        return f64::INFINITY;
    }
    -u.ln() / weight as f64
}
