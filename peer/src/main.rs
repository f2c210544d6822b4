use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use peer::{PeerClient, PeerConfig};

#[derive(Parser)]
#[command(name = "shoal-peer", about = "shoal peer agent")]
struct Args {

    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    cas_root: Option<PathBuf>,

    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    #[arg(long)]
    tracker: Option<String>,

    #[arg(long)]
    zone: Option<String>,

    /// Download a blob (sha256:<hex>) then keep seeding it.
    #[arg(long)]
    download: Option<String>,

    #[arg(long, default_value = "default")]
    namespace: String,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let args = Args::parse();
    let mut config: PeerConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).context("parsing config")?
        }
        None => PeerConfig::default(),
    };
    if let Some(cas_root) = args.cas_root {
        config.cas_root = cas_root;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(tracker) = args.tracker {
        config.tracker = tracker;
    }
    if let Some(zone) = args.zone {
        config.zone = zone;
    }

    let client = PeerClient::start(config).await?;

    if let Some(digest) = args.download {
        let digest = digest.parse().context("parsing digest")?;
        client.download(&args.namespace, &digest).await?;
        tracing::info!("download complete, seeding until interrupted");
    }

    tokio::signal::ctrl_c().await?;
    client.shutdown().await;
    Ok(())
}
