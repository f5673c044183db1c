#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! SecureDrop coordination and transfer library
//!
//! A LAN file-exchange system: a central TLS Coordinator
//! authenticates users, maintains a mutual contact graph, and brokers
//! direct peer-to-peer transfers between two peers on the same
//! network. File bytes travel only on the peer-to-peer stream; the
//! Coordinator persists nothing but email hashes, salted credential
//! hashes, and encrypted profile envelopes.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod server;
pub mod store;
pub mod tls;
pub mod transfer;

pub use client::{Client, RegisteredEmails};
pub use config::{ClientConfig, DEFAULT_PORT, ServerConfig};
pub use error::{Error, Result};
pub use server::Coordinator;
pub use store::AccountStore;
pub use transfer::{CHUNK_SIZE, Progress, Receiver};
