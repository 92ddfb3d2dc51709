use anyhow::Context;
use clap::Parser;
use fplan_engine::Settings;
use fplan_protocol::Configuration;
use fplan_server::Startup;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Serves a cached floor plan and its bridge over a local-only HTTP port.
#[derive(Debug, Parser)]
#[command(name = "fplan-server", version)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:39333")]
    addr: SocketAddr,
    /// Parent of the `fplan/` cache directory. Defaults to the platform cache dir.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Event to load at startup, e.g. `https://acme.expofp.com`.
    #[arg(long)]
    event_url: Option<String>,
    /// Serve only what is cached; never touch the network.
    #[arg(long)]
    offline: bool,
    /// Asset tree copied into a missing cache on offline loads.
    #[arg(long)]
    bundled_dir: Option<PathBuf>,
    /// Configuration document used instead of the remote one.
    #[arg(long)]
    configuration: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut settings = match args.cache_dir {
        Some(dir) => Settings::new(dir),
        None => Settings::default(),
    };
    settings.bundled_dir = args.bundled_dir;
    if let Some(path) = args.configuration {
        let raw = std::fs::read(&path)
            .with_context(|| format!("read configuration: {}", path.display()))?;
        let config = Configuration::from_json(&raw)
            .with_context(|| format!("parse configuration: {}", path.display()))?;
        settings.configuration_override = Some(config);
    }

    let startup = args.event_url.map(|event_url| Startup {
        event_url,
        online: !args.offline,
    });
    tracing::info!(cache = %settings.cache_root.display(), "fplan server starting");
    fplan_server::serve(args.addr, settings, startup).await
}
