use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;
use tracker::{spawn_tracker, TrackerConfig};

#[derive(Parser)]
#[command(name = "shoal-tracker", about = "shoal tracker")]
struct Args {

    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Bootstrap origin address; repeatable.
    #[arg(long = "origin")]
    origins: Vec<String>,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let args = Args::parse();
    let mut config: TrackerConfig = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).context("parsing config")?
        }
        None => TrackerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if !args.origins.is_empty() {
        config.origins = args.origins;
    }
    anyhow::ensure!(!config.origins.is_empty(), "at least one --origin is required");

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    let handle = spawn_tracker(config, listener).await?;

    tokio::signal::ctrl_c().await?;
    handle.task.abort();
    Ok(())
}
