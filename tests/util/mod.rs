//! Shared helpers for integration tests
//!
//! Each test gets a throwaway Coordinator: a self-signed certificate
//! minted with `rcgen`, an empty account store in a temp directory,
//! and a listener on an OS-assigned port.

#![allow(dead_code)]

use rcgen::generate_simple_self_signed;
use securedrop::{Client, ClientConfig, Coordinator, ServerConfig};
use std::path::{Path, PathBuf};

pub struct TestCoordinator {
    pub port: u16,
    pub cert_path: PathBuf,
    pub state_path: PathBuf,
    pub dir: tempfile::TempDir,
    /// Handle to the accept loop so it lives as long as the test.
    _handle: tokio::task::JoinHandle<()>,
}

/// Start a fresh Coordinator with empty state on an ephemeral port.
pub async fn start_coordinator() -> TestCoordinator {
    // Multiple tests may race to install the provider; ignore the
    // error if it's already set.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let dir = tempfile::tempdir().expect("create temp dir");
    let cert_path = dir.path().join("server.pem");
    write_self_signed_pem(&cert_path);
    let state_path = dir.path().join("server.json");

    let config = ServerConfig {
        port: 0,
        cert_path: cert_path.clone(),
        state_path: state_path.clone(),
    };
    let coordinator = Coordinator::bind(&config).await.expect("bind coordinator");
    let port = coordinator.port();
    let handle = tokio::spawn(async move {
        let _ = coordinator.run().await;
    });

    TestCoordinator {
        port,
        cert_path,
        state_path,
        dir,
        _handle: handle,
    }
}

/// Write a self-signed certificate plus its PKCS#8 key as one PEM
/// file, the layout the server and receiver load.
pub fn write_self_signed_pem(path: &Path) {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
        .expect("generate self-signed cert");
    let pem = format!("{}{}", cert.cert.pem(), cert.key_pair.serialize_pem());
    std::fs::write(path, pem).expect("write pem");
}

pub fn client_config(coordinator: &TestCoordinator) -> ClientConfig {
    ClientConfig {
        hostname: "127.0.0.1".to_string(),
        port: coordinator.port,
        cert_path: coordinator.cert_path.clone(),
        state_path: coordinator.dir.path().join("client.json"),
        p2p_host: "127.0.0.1".to_string(),
    }
}

/// Open a control session to the test Coordinator.
pub async fn connect(coordinator: &TestCoordinator) -> Client {
    Client::connect(client_config(coordinator))
        .await
        .expect("connect to coordinator")
}
