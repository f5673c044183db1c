#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! The SecureDrop Coordinator daemon

use clap::Parser;
use securedrop::{Coordinator, ServerConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "securedrop-server")]
#[command(about = "Coordinator for SecureDrop LAN file exchange")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Account store file
    #[arg(long)]
    filename: Option<PathBuf>,

    /// PEM file with the server certificate chain and private key
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    let filter = if args.debug {
        EnvFilter::new("securedrop=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServerConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(filename) = args.filename {
        config.state_path = filename;
    }
    if let Some(cert) = args.cert {
        config.cert_path = cert;
    }

    let coordinator = Coordinator::bind(&config).await?;
    tokio::select! {
        result = coordinator.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down");
        }
    }
    Ok(())
}
