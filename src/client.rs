//! Client control session
//!
//! Drives the Coordinator from the user side: registration, login,
//! contact management, polling for incoming transfer requests, and
//! both ends of the transfer brokerage. One instance owns one TLS
//! session; every request gets its reply on the same stream, so calls
//! are strictly sequential. Unsolicited `FTPT` frames (the sender's
//! port notification, which can arrive between polls) are stashed
//! until [`Client::await_port_token`] asks for them.

use crate::config::ClientConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::frame::{
    self, AcceptRequestPayload, AddContactPayload, CheckRequestsPayload, ContactsPayload,
    FileInfo, ListContactsPayload, LoginPayload, PendingRequestsPayload, PortTokenPayload,
    RegisterPayload, SendPortPayload, StatusPayload, Tag, TokenPayload, TransferRequestPayload,
};
use crate::tls;
use crate::transfer::{self, Progress};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Minimum password length, enforced client-side before any wire
/// traffic.
pub const MIN_PASSWORD_LEN: usize = 12;

type ControlStream = tokio_rustls::client::TlsStream<TcpStream>;

/// A control session with the Coordinator.
pub struct Client {
    config: ClientConfig,
    reader: BufReader<ReadHalf<ControlStream>>,
    writer: WriteHalf<ControlStream>,
    /// Unsolicited `FTPT` frames read while awaiting something else.
    pending: VecDeque<Vec<u8>>,
}

impl Client {
    /// Open the TLS control session to the Coordinator.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = tls::connect(&config.hostname, config.port).await?;
        info!("Connected to coordinator at {}:{}", config.hostname, config.port);
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            config,
            reader: BufReader::new(read_half),
            writer: write_half,
            pending: VecDeque::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register a new account. Returns the Coordinator's status text;
    /// empty means success and the session is now authenticated.
    pub async fn register(&mut self, name: &str, email: &str, password: &str) -> Result<String> {
        self.send(
            Tag::Register,
            &RegisterPayload {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            },
        )
        .await?;
        self.read_status().await
    }

    /// Log in. Returns the Coordinator's status text; empty means
    /// success.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<String> {
        self.send(
            Tag::Login,
            &LoginPayload {
                email: email.to_string(),
                password: password.to_string(),
            },
        )
        .await?;
        self.read_status().await
    }

    /// Add a contact to this user's contact map.
    pub async fn add_contact(&mut self, name: &str, email: &str) -> Result<String> {
        self.send(
            Tag::AddContact,
            &AddContactPayload {
                name: name.to_string(),
                email: email.to_string(),
            },
        )
        .await?;
        self.read_status().await
    }

    /// List contacts that are online and have added this user back.
    pub async fn list_contacts(&mut self) -> Result<BTreeMap<String, String>> {
        self.send(Tag::ListContacts, &ListContactsPayload {}).await?;
        let payload = self.read_reply(Tag::Contacts).await?;
        let contacts: ContactsPayload = frame::decode(Tag::Contacts, &payload)?;
        Ok(contacts.contacts)
    }

    /// Poll for pending incoming transfer requests.
    pub async fn poll_requests(&mut self) -> Result<BTreeMap<String, FileInfo>> {
        self.send(Tag::CheckRequests, &CheckRequestsPayload {}).await?;
        let payload = self.read_reply(Tag::PendingRequests).await?;
        let pending: PendingRequestsPayload = frame::decode(Tag::PendingRequests, &payload)?;
        Ok(pending.requests)
    }

    /// Ask the Coordinator to broker a transfer. Returns the status
    /// text; empty means the request is enqueued for the recipient.
    pub async fn request_transfer(
        &mut self,
        recipient_email: &str,
        file_info: FileInfo,
    ) -> Result<String> {
        self.send(
            Tag::TransferRequest,
            &TransferRequestPayload {
                recipient_email: recipient_email.to_string(),
                file_info,
            },
        )
        .await?;
        self.read_status().await
    }

    /// Accept one pending request. Returns the transfer token; a
    /// `STAT` reply instead of a token becomes [`Error::Transfer`].
    pub async fn accept_transfer(&mut self, sender_email: &str) -> Result<String> {
        self.send(
            Tag::AcceptRequest,
            &AcceptRequestPayload {
                sender_email: sender_email.to_string(),
            },
        )
        .await?;
        loop {
            match self.read_one().await? {
                (Tag::Token, payload) => {
                    let token: TokenPayload = frame::decode(Tag::Token, &payload)?;
                    return Ok(token.token);
                }
                (Tag::Status, payload) => {
                    let status: StatusPayload = frame::decode(Tag::Status, &payload)?;
                    return Err(Error::Transfer(status.message));
                }
                (Tag::PortToken, payload) => self.pending.push_back(payload),
                (tag, _) => {
                    return Err(unexpected(tag));
                }
            }
        }
    }

    /// Deny every pending request. The Coordinator notifies each
    /// enqueued sender; there is no reply to us.
    pub async fn deny_all(&mut self) -> Result<()> {
        self.send(
            Tag::AcceptRequest,
            &AcceptRequestPayload {
                sender_email: String::new(),
            },
        )
        .await
    }

    /// Report the receiver's listen port; the Coordinator forwards it
    /// to the sender. Fire-and-forget.
    pub async fn send_port(&mut self, port: u16) -> Result<()> {
        self.send(Tag::SendPort, &SendPortPayload { port }).await
    }

    /// Wait for the Coordinator to forward `{port, token}` after the
    /// recipient has decided. An empty token means the request was
    /// denied.
    pub async fn await_port_token(&mut self) -> Result<PortTokenPayload> {
        let payload = self.read_reply(Tag::PortToken).await?;
        frame::decode(Tag::PortToken, &payload)
    }

    /// The full send flow: hash the file, request the transfer, wait
    /// for the recipient's decision, then stream the file peer to
    /// peer.
    pub async fn send_file(
        &mut self,
        recipient_email: &str,
        path: &Path,
        progress: &Arc<Progress>,
    ) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Transfer("Invalid file name".into()))?
            .to_string();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::Transfer(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let sha256 = crypto::sha256_file(path)?;
        let file_info = FileInfo {
            name,
            size: metadata.len(),
            sha256,
        };

        let status = self.request_transfer(recipient_email, file_info).await?;
        if !status.is_empty() {
            return Err(Error::Transfer(status));
        }
        debug!("Transfer request enqueued; awaiting the recipient's decision");

        let port_token = self.await_port_token().await?;
        if port_token.token.is_empty() {
            return Err(Error::Transfer("User declined".into()));
        }
        let host = self.config.p2p_host.clone();
        transfer::send_file(&host, port_token.port, &port_token.token, path, progress).await
    }

    // -- private helpers --

    async fn send<T: Serialize>(&mut self, tag: Tag, payload: &T) -> Result<()> {
        frame::write_frame(&mut self.writer, tag, payload).await
    }

    async fn read_status(&mut self) -> Result<String> {
        let payload = self.read_reply(Tag::Status).await?;
        let status: StatusPayload = frame::decode(Tag::Status, &payload)?;
        Ok(status.message)
    }

    /// Read frames until one with the wanted tag arrives, stashing
    /// unsolicited `FTPT` frames along the way.
    async fn read_reply(&mut self, want: Tag) -> Result<Vec<u8>> {
        if want == Tag::PortToken
            && let Some(payload) = self.pending.pop_front()
        {
            return Ok(payload);
        }
        loop {
            let (tag, payload) = self.read_one().await?;
            if tag == want {
                return Ok(payload);
            }
            if tag == Tag::PortToken {
                self.pending.push_back(payload);
                continue;
            }
            return Err(unexpected(tag));
        }
    }

    async fn read_one(&mut self) -> Result<(Tag, Vec<u8>)> {
        frame::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| Error::Protocol("Connection closed by coordinator".into()))
    }
}

fn unexpected(tag: Tag) -> Error {
    Error::Protocol(format!(
        "Unexpected {} frame from coordinator",
        String::from_utf8_lossy(tag.as_bytes())
    ))
}

/// Whether a password satisfies the client-side policy.
#[must_use]
pub fn password_meets_policy(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LEN
}

/// The client-local cache of emails registered from this machine: a
/// JSON array of strings. Missing or unreadable files behave as an
/// empty cache.
pub struct RegisteredEmails {
    path: PathBuf,
    emails: Vec<String>,
}

impl RegisteredEmails {
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let emails = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();
        Self { path, emails }
    }

    #[must_use]
    pub fn emails(&self) -> &[String] {
        &self.emails
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }

    /// Record an email, deduplicating, and save the cache.
    pub fn add(&mut self, email: &str) -> Result<()> {
        if !self.emails.iter().any(|e| e == email) {
            self.emails.push(email.to_string());
        }
        std::fs::write(&self.path, serde_json::to_string(&self.emails)?)?;
        Ok(())
    }
}
