//! Client and server connection configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Default Coordinator port.
pub const DEFAULT_PORT: u16 = 6969;

/// Configuration for the client control session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator hostname.
    pub hostname: String,
    /// Coordinator port.
    pub port: u16,
    /// PEM file holding the certificate chain and private key used by
    /// the peer-to-peer receiver listener.
    pub cert_path: PathBuf,
    /// Local registered-email cache.
    pub state_path: PathBuf,
    /// Host the sender dials for the peer-to-peer stream. The
    /// Coordinator only brokers transfers between sessions with the
    /// same remote IP, so the default of `localhost` covers the
    /// deployments the system targets.
    pub p2p_host: String,
}

impl ClientConfig {
    /// Load client configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional
    /// (with defaults):
    /// - `SECUREDROP_HOST` (default: `localhost`)
    /// - `SECUREDROP_PORT` (default: `6969`)
    /// - `SECUREDROP_CERT` (default: `server.pem`)
    /// - `SECUREDROP_CLIENT_STATE` (default: `client.json`)
    /// - `SECUREDROP_P2P_HOST` (default: `localhost`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            hostname: env::var("SECUREDROP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: port_from_env()?,
            cert_path: env::var("SECUREDROP_CERT")
                .unwrap_or_else(|_| "server.pem".to_string())
                .into(),
            state_path: env::var("SECUREDROP_CLIENT_STATE")
                .unwrap_or_else(|_| "client.json".to_string())
                .into(),
            p2p_host: env::var("SECUREDROP_P2P_HOST").unwrap_or_else(|_| "localhost".to_string()),
        })
    }
}

/// Configuration for the Coordinator.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on. `0` lets the OS choose.
    pub port: u16,
    /// PEM file holding the server certificate chain and private key.
    pub cert_path: PathBuf,
    /// Account store persistence file.
    pub state_path: PathBuf,
}

impl ServerConfig {
    /// Load server configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional
    /// (with defaults):
    /// - `SECUREDROP_PORT` (default: `6969`)
    /// - `SECUREDROP_CERT` (default: `server.pem`)
    /// - `SECUREDROP_SERVER_STATE` (default: `server.json`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: port_from_env()?,
            cert_path: env::var("SECUREDROP_CERT")
                .unwrap_or_else(|_| "server.pem".to_string())
                .into(),
            state_path: env::var("SECUREDROP_SERVER_STATE")
                .unwrap_or_else(|_| "server.json".to_string())
                .into(),
        })
    }
}

fn port_from_env() -> Result<u16> {
    env::var("SECUREDROP_PORT")
        .unwrap_or_else(|_| DEFAULT_PORT.to_string())
        .parse()
        .map_err(|e| Error::Config(format!("Invalid SECUREDROP_PORT: {e}")))
}
