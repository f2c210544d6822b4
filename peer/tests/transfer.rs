use std::{io::Write, time::Duration};
use tokio::time;
use shoal::{
    store::{CasStore, MetadataKind},
    Digest, MetaInfo,
};
use peer::{PeerClient, PeerConfig};

const PIECE_LENGTH: u64 = 128;

fn test_config(cas_root: &std::path::Path) -> PeerConfig {
    PeerConfig {
        cas_root: cas_root.to_path_buf(),
        listen: "127.0.0.1:0".parse().unwrap(),
        // These tests wire peers together directly.
        announce_enabled: false,
        ..PeerConfig::default()
    }
}

// Puts a blob into a CAS the way an origin would: sealed under its
// digest with a metainfo sidecar.
fn install_blob(root: &std::path::Path, data: &[u8]) -> (Digest, MetaInfo) {
    let cas = CasStore::new(root).unwrap();
    let digest = Digest::compute(data);
    let metainfo = MetaInfo::generate(data, digest.hex(), PIECE_LENGTH).unwrap();

    cas.create_upload("install").unwrap();
    cas.open_upload("install").unwrap().write_all(data).unwrap();
    cas.seal("install", &digest).unwrap();
    cas.set_metadata(&digest, MetadataKind::TorrentMeta, &metainfo.to_bytes().unwrap())
        .unwrap();
    (digest, metainfo)
}

fn read_blob(root: &std::path::Path, digest: &Digest) -> Vec<u8> {
    use std::io::Read;
    let cas = CasStore::new(root).unwrap();
    let mut buf = Vec::new();
    cas.get_cache(digest).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

async fn wait_done(mut done: tokio::sync::watch::Receiver<bool>) {
    time::timeout(Duration::from_secs(30), async {
        while !*done.borrow() {
            done.changed().await.expect("torrent dropped");
        }
    })
    .await
    .expect("download timed out");
}

#[tokio::test]
async fn test_leech_downloads_blob_from_seed() {

    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let seed_dir = tempfile::tempdir().unwrap();
    let (digest, metainfo) = install_blob(seed_dir.path(), &data);
    let seed = PeerClient::start(test_config(seed_dir.path())).await.unwrap();
    seed.seed_cached(&digest).await.unwrap();

    let leech_dir = tempfile::tempdir().unwrap();
    let leech = PeerClient::start(test_config(leech_dir.path())).await.unwrap();

    let done = leech.add_torrent(&digest, metainfo.clone()).await.unwrap();
    leech.connect_peer(metainfo.info_hash(), seed.local_ctx().clone());
    wait_done(done).await;

    assert_eq!(read_blob(leech_dir.path(), &digest), data);

    leech.shutdown().await;
    seed.shutdown().await;
}

#[tokio::test]
async fn test_completed_leech_reserves_the_swarm() {

    let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();

    let seed_dir = tempfile::tempdir().unwrap();
    let (digest, metainfo) = install_blob(seed_dir.path(), &data);
    let seed = PeerClient::start(test_config(seed_dir.path())).await.unwrap();
    seed.seed_cached(&digest).await.unwrap();

    // First leech fills from the origin seed.
    let first_dir = tempfile::tempdir().unwrap();
    let first = PeerClient::start(test_config(first_dir.path())).await.unwrap();
    let done = first.add_torrent(&digest, metainfo.clone()).await.unwrap();
    first.connect_peer(metainfo.info_hash(), seed.local_ctx().clone());
    wait_done(done).await;

    // The original seed goes away; the second leech only knows the
    // first, now-complete, peer.
    seed.shutdown().await;

    let second_dir = tempfile::tempdir().unwrap();
    let second = PeerClient::start(test_config(second_dir.path())).await.unwrap();
    let done = second.add_torrent(&digest, metainfo.clone()).await.unwrap();
    second.connect_peer(metainfo.info_hash(), first.local_ctx().clone());
    wait_done(done).await;

    assert_eq!(read_blob(second_dir.path(), &digest), data);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_add_torrent_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let data = vec![1u8; 300];
    let (digest, metainfo) = install_blob(dir.path(), &data);

    let client = PeerClient::start(test_config(dir.path())).await.unwrap();
    let a = client.add_torrent(&digest, metainfo.clone()).await.unwrap();
    let b = client.add_torrent(&digest, metainfo).await.unwrap();
    // Cached blob registers as a seed: done from the start, both handles.
    assert!(*a.borrow());
    assert!(*b.borrow());
    client.shutdown().await;
}
