use std::fs;

use anyhow::{anyhow, Context};
use clap::Parser;
use reqroom::config::{self, Config};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Overrides the port from the config file.
    #[clap(long = "port")]
    port: Option<u16>,
    config_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config_path {
        Some(path) => {
            let src = fs::read_to_string(path).with_context(|| format!("cannot read {}", path))?;
            config::parse_config(&src).map_err(|e| anyhow!("invalid config {}: {}", path, e))?
        }
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = reqroom::serve(&config, ("0.0.0.0", config.port))
        .await
        .map_err(|e| anyhow!(e))?;

    shutdown_signal().await;
    info!("shutting down");
    server.shutdown().await.map_err(|e| anyhow!(e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
