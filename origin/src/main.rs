use std::{path::PathBuf, sync::Arc};
use anyhow::Context;
use clap::Parser;
use origin::{spawn_origin, FsBackend, OriginConfig};

#[derive(Parser)]
#[command(name = "shoal-origin", about = "shoal origin blob server")]
struct Args {

    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    label: Option<String>,

    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    #[arg(long)]
    cas_root: Option<PathBuf>,

    #[arg(long)]
    backend_root: Option<PathBuf>,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let args = Args::parse();
    let mut config: OriginConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).context("parsing config")?
        }
        None => OriginConfig::default(),
    };
    if let Some(label) = args.label {
        config.label = label;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(cas_root) = args.cas_root {
        config.cas_root = cas_root;
    }
    if let Some(backend_root) = args.backend_root {
        config.backend_root = backend_root;
    }
    anyhow::ensure!(
        config.ring.nodes.iter().any(|n| n.label == config.label),
        "config.ring must contain this origin's label ({})",
        config.label,
    );

    let backend = Arc::new(FsBackend::new(config.backend_root.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    let handle = spawn_origin(config, backend, listener).await?;

    tokio::signal::ctrl_c().await?;
    handle.task.abort();
    Ok(())
}
