use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use zif::{Config, LocalPeer, MemoryCatalog, TcpDialer};

#[derive(Parser, Debug)]
#[command(name = "zifd")]
#[command(author, version, about = "Zif network daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "./zif.toml")]
    config: String,

    /// Override the Zif bind address from the config.
    #[arg(short, long)]
    bind: Option<String>,

    /// Publicly reachable host for our entry (IP, domain or onion).
    #[arg(short, long)]
    public: Option<String>,

    /// Human-readable node name for our entry.
    #[arg(short, long)]
    name: Option<String>,

    /// Peers to bootstrap from (host:port), repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<String>,

    /// Data directory.
    #[arg(short, long, default_value = "./data")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&args.config).context("loading configuration")?;
    let bind = args.bind.clone().unwrap_or_else(|| config.bind.zif.clone());

    let node = LocalPeer::new(
        config,
        &args.data,
        Arc::new(MemoryCatalog::new()),
        Box::new(TcpDialer),
    )
    .context("bringing up local peer")?;

    if let Some(name) = &args.name {
        node.local_set("name", name)?;
    }
    if let Some(public) = &args.public {
        node.local_set("public", public)?;
    }

    let local = node.listen(&bind).await.context("binding zif listener")?;
    info!(addr = %local, zif = %node.address(), "node up");

    for host in &args.bootstrap {
        info!(peer = %host, "bootstrapping");
        match node.bootstrap(host).await {
            Ok(()) => info!("bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    node.start_exploring();

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    node.close().await;

    Ok(())
}
