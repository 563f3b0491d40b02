//! Brume background service.
//!
//! Usage:
//!   brume-server
//!   brume-server --config ~/.config/brume/background.toml
//!   brume-server --listen 127.0.0.1:9595 --proxy 127.0.0.1:9150

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use brume_kernel::{Background, BackgroundConfig};
use brume_server::constants::DEFAULT_LISTEN_ADDRESS;
use brume_server::{PortBrowser, PortServer, Socks5Connector};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

/// Background process of the Brume wallet.
#[derive(Parser, Debug)]
#[command(name = "brume-server")]
#[command(about = "Background process of the Brume wallet")]
struct Args {
    /// TOML config file; defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept port connections on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
    listen: SocketAddr,

    /// SOCKS5 proxy to use instead of the configured ones (repeatable)
    #[arg(short, long)]
    proxy: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BackgroundConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => BackgroundConfig::default(),
    };
    if !args.proxy.is_empty() {
        config.tor.proxies = args.proxy;
    }
    tracing::info!(proxies = ?config.tor.proxies, "using tor proxies");

    let browser = Arc::new(PortBrowser::new());
    let background = Background::open(config, browser.clone(), Arc::new(Socks5Connector))
        .context("opening storage")?;

    PortServer::new(background, browser)
        .run(args.listen)
        .await
        .with_context(|| format!("serving on {}", args.listen))
}
