//! Turbine Server
//!
//! A standalone routing server: joins its parent, opens its configured
//! shortcuts and routes messages for the servers connected to it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use turbine_core::RoutedMessage;
use turbine_router::{LocalHandler, Router, RouterConfig, ShortcutConfig};
use turbine_transport::{Dialer, TcpServer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "turbine-server")]
#[command(about = "Turbine routing server")]
#[command(version)]
struct Cli {
    /// Listen address (defaults to the configured server address)
    #[arg(short, long)]
    listen: Option<String>,

    /// Address other servers dial to reach this one (defaults to the listen address)
    #[arg(short, long)]
    address: Option<String>,

    /// Server name, e.g. /plant/line1
    #[arg(short, long)]
    name: Option<String>,

    /// Address of the parent server
    #[arg(short, long)]
    parent: Option<String>,

    /// Active shortcut as NAME=ADDRESS or NAME=ADDRESS@COST
    #[arg(short, long = "shortcut")]
    shortcuts: Vec<String>,

    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Logs messages addressed to this server and answers with an empty payload
struct LoggingHandler;

#[async_trait]
impl LocalHandler for LoggingHandler {
    async fn handle(&self, message: RoutedMessage) -> turbine_router::Result<Bytes> {
        tracing::info!(
            "{} -> {}: {} bytes",
            message.source,
            message.destination,
            message.payload.len()
        );
        Ok(Bytes::new())
    }
}

fn parse_shortcut(arg: &str) -> Result<ShortcutConfig> {
    let (destination, target) = arg
        .split_once('=')
        .with_context(|| format!("shortcut '{}' is not NAME=ADDRESS", arg))?;
    let (address, cost) = match target.rsplit_once('@') {
        Some((address, cost)) => (
            address,
            cost.parse::<f64>()
                .with_context(|| format!("bad shortcut cost in '{}'", arg))?,
        ),
        None => (target, 1.0),
    };
    let shortcut = ShortcutConfig {
        destination: destination.to_string(),
        address: address.to_string(),
        cost,
        active: true,
    };
    shortcut.to_shortcut()?;
    Ok(shortcut)
}

/// Load the router configuration and the address to listen on
fn load_config(cli: &Cli) -> Result<(RouterConfig, String)> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<RouterConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => RouterConfig::default(),
    };

    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    let listen = cli.listen.clone().unwrap_or_else(|| config.address.clone());
    config.address = cli.address.clone().unwrap_or_else(|| listen.clone());
    if let Some(parent) = &cli.parent {
        config.parent = Some(parent.clone());
    }
    for arg in &cli.shortcuts {
        config = config.with_shortcut(parse_shortcut(arg)?);
    }

    config.validate()?;
    Ok((config, listen))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, listen) = load_config(&cli)?;
    let tick = config.tick_interval();

    tracing::info!("Starting Turbine server {}", config.name);
    tracing::info!("Listening on: {}", listen);
    if let Some(parent) = &config.parent {
        tracing::info!("Parent: {}", parent);
    }

    let server = TcpServer::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    let router = Router::new(config, Arc::new(Dialer::new()), Arc::new(LoggingHandler))?;

    let serving = router.clone();
    let mut serve = tokio::spawn(async move { serving.serve_on(server).await });
    router.start().await?;
    let ticker = router.run_ticker(tick);

    tracing::info!("Router ready, accepting connections...");

    tokio::select! {
        result = &mut serve => {
            ticker.abort();
            result.context("server task failed")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    router.stop().await;
    let _ = serve.await;
    let _ = ticker.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shortcut() {
        let shortcut = parse_shortcut("/plant/line1=127.0.0.1:3334@1.5").unwrap();
        assert_eq!(shortcut.destination, "/plant/line1");
        assert_eq!(shortcut.address, "127.0.0.1:3334");
        assert_eq!(shortcut.cost, 1.5);
        assert!(shortcut.active);

        assert_eq!(parse_shortcut("/b=mem:b").unwrap().cost, 1.0);
        assert!(parse_shortcut("/b").is_err());
        assert!(parse_shortcut("/b=mem:b@cheap").is_err());
        assert!(parse_shortcut("/b=mem:b@0.5").is_err());
    }

    #[test]
    fn test_listen_defaults_advertised_address() {
        let cli = Cli::parse_from(["turbine-server", "--name", "/r", "--listen", "127.0.0.1:4000"]);
        let (config, listen) = load_config(&cli).unwrap();
        assert_eq!(listen, "127.0.0.1:4000");
        assert_eq!(config.address, "127.0.0.1:4000");
        assert_eq!(config.name, "/r");
    }
}
