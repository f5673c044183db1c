//! The Coordinator
//!
//! A TLS server that authenticates users, maintains the contact graph,
//! and brokers peer-to-peer transfers. It owns the account store, the
//! session/email bindings, the transfer-request queue, and the
//! token/port rendezvous records. File bytes never pass through it.
//!
//! Each accepted connection gets a reader task (the per-message
//! dispatch loop) and a writer task draining a per-session channel, so
//! a handler can deliver frames to *other* sessions without touching
//! their streams directly. Handlers do in-memory work only; locks are
//! never held across a suspension point.

use crate::config::ServerConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::frame::{
    self, AcceptRequestPayload, AddContactPayload, ContactsPayload, FileInfo, LoginPayload,
    PendingRequestsPayload, PortTokenPayload, RegisterPayload, SendPortPayload, StatusPayload,
    Tag, TokenPayload, TransferRequestPayload,
};
use crate::store::AccountStore;
use crate::tls;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

type SessionId = u64;

/// One live connection.
struct Session {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    remote: SocketAddr,
    /// Set by the first successful register or login.
    email: Option<String>,
}

/// An accepted transfer waiting for the receiver's port.
struct Rendezvous {
    token: String,
    sender: SessionId,
}

/// Session bindings, pending transfer requests, and rendezvous
/// records. Guarded by its own mutex; when the account store lock is
/// also needed, the store is always taken first.
#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    email_to_session: HashMap<String, SessionId>,
    /// `recipient email -> sender email -> file info`. A sender has at
    /// most one pending request per recipient (re-enqueue replaces).
    transfer_requests: HashMap<String, BTreeMap<String, FileInfo>>,
    rendezvous: HashMap<SessionId, Rendezvous>,
}

struct Inner {
    store: Mutex<AccountStore>,
    state: Mutex<State>,
    next_session: AtomicU64,
}

/// The Coordinator server.
pub struct Coordinator {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    port: u16,
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Load the TLS identity and account store, then bind the listen
    /// socket. `config.port == 0` lets the OS choose.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let acceptor = tls::acceptor_from_pem(&config.cert_path)?;
        let store = AccountStore::open(&config.state_path)?;
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            listener,
            acceptor,
            port,
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                state: Mutex::new(State::default()),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    /// The port the Coordinator is listening on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until the process is stopped. Each
    /// connection runs in its own task.
    pub async fn run(self) -> Result<()> {
        info!("Coordinator listening on port {}", self.port);
        loop {
            let (stream, remote) = self.listener.accept().await?;
            let acceptor = self.acceptor.clone();
            let inner = Arc::clone(&self.inner);
            let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                handle_connection(inner, acceptor, stream, remote, id).await;
            });
        }
    }
}

/// Run one session: TLS handshake, registration in the session map,
/// the dispatch loop, and teardown.
async fn handle_connection(
    inner: Arc<Inner>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    id: SessionId,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TLS handshake with {remote} failed: {e}");
            return;
        }
    };
    debug!("Session {id} connected from {remote}");

    let (read_half, mut write_half) = tokio::io::split(tls_stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    lock(&inner.state).sessions.insert(
        id,
        Session {
            tx,
            remote,
            email: None,
        },
    );

    // Writer task: drains the session channel onto the stream. It
    // exits when the channel closes (teardown drops the sender) or
    // the peer stops reading.
    let writer = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() || write_half.flush().await.is_err() {
                break;
            }
        }
        write_half.shutdown().await.ok();
    });

    let mut reader = BufReader::new(read_half);
    loop {
        match frame::read_frame(&mut reader).await {
            Ok(Some((tag, payload))) => {
                if let Err(e) = handle_frame(&inner, id, tag, &payload) {
                    // A session never dies on peer misbehavior.
                    warn!("Session {id}: {e}");
                }
            }
            Ok(None) => break,
            Err(Error::Protocol(msg)) => {
                warn!("Session {id}: {msg}");
            }
            Err(e) => {
                debug!("Session {id} read failed: {e}");
                break;
            }
        }
    }

    teardown(&inner, id);
    writer.await.ok();
    debug!("Session {id} closed");
}

/// Dispatch one frame. Malformed payloads yield an error the caller
/// logs; the session continues either way.
#[allow(clippy::too_many_lines)]
fn handle_frame(inner: &Inner, id: SessionId, tag: Tag, payload: &[u8]) -> Result<()> {
    match tag {
        Tag::Register => {
            let p: RegisterPayload = frame::decode(tag, payload)?;
            let message = lock(&inner.store).register(&p.name, &p.email, &p.password);
            let mut state = lock(&inner.state);
            let message = if message.is_empty() {
                bind_session(&mut state, id, p.email.trim())
            } else {
                message
            };
            reply_status(&state, id, &message);
        }
        Tag::Login => {
            let p: LoginPayload = frame::decode(tag, payload)?;
            let message = lock(&inner.store).authenticate(&p.email, &p.password);
            let mut state = lock(&inner.state);
            let message = if message.is_empty() {
                bind_session(&mut state, id, p.email.trim())
            } else {
                message
            };
            reply_status(&state, id, &message);
        }
        Tag::AddContact => {
            let p: AddContactPayload = frame::decode(tag, payload)?;
            let Some(owner) = session_email(inner, id) else {
                not_authenticated(inner, id);
                return Ok(());
            };
            let message = lock(&inner.store).add_contact(&owner, &p.name, &p.email);
            reply_status(&lock(&inner.state), id, &message);
        }
        Tag::ListContacts => {
            let Some(owner) = session_email(inner, id) else {
                not_authenticated(inner, id);
                return Ok(());
            };
            // Mutual online set: the contact has a live session and
            // has added the caller back.
            let store = lock(&inner.store);
            let state = lock(&inner.state);
            let mut contacts = BTreeMap::new();
            for (email, name) in store.get_contacts(&owner) {
                if state.email_to_session.contains_key(&email)
                    && store.contacts_contains(&email, &owner)
                {
                    contacts.insert(email, name);
                }
            }
            send_to(&state, id, Tag::Contacts, &ContactsPayload { contacts });
        }
        Tag::TransferRequest => {
            let p: TransferRequestPayload = frame::decode(tag, payload)?;
            let Some(sender_email) = session_email(inner, id) else {
                not_authenticated(inner, id);
                return Ok(());
            };
            let recipient_email = p.recipient_email.trim().to_string();
            if recipient_email == sender_email {
                let state = lock(&inner.state);
                reply_status(&state, id, "Cannot send a file to yourself.");
                return Ok(());
            }

            let store = lock(&inner.store);
            let mut state = lock(&inner.state);
            let Some(&recipient_session) = state.email_to_session.get(&recipient_email) else {
                reply_status(&state, id, "User is not online.");
                return Ok(());
            };
            if !store.contacts_contains(&recipient_email, &sender_email) {
                reply_status(
                    &state,
                    id,
                    &format!("User [{sender_email}] has not added you as a contact"),
                );
                return Ok(());
            }
            let same_network = match (
                state.sessions.get(&id),
                state.sessions.get(&recipient_session),
            ) {
                (Some(sender), Some(recipient)) => {
                    sender.remote.ip() == recipient.remote.ip()
                }
                _ => false,
            };
            if !same_network {
                reply_status(&state, id, "Sender and recipient are not on the same network.");
                return Ok(());
            }
            state
                .transfer_requests
                .entry(recipient_email)
                .or_default()
                .insert(sender_email, p.file_info);
            reply_status(&state, id, "");
        }
        Tag::CheckRequests => {
            let Some(owner) = session_email(inner, id) else {
                not_authenticated(inner, id);
                return Ok(());
            };
            let state = lock(&inner.state);
            let requests = state
                .transfer_requests
                .get(&owner)
                .cloned()
                .unwrap_or_default();
            send_to(&state, id, Tag::PendingRequests, &PendingRequestsPayload { requests });
        }
        Tag::AcceptRequest => {
            let p: AcceptRequestPayload = frame::decode(tag, payload)?;
            let Some(owner) = session_email(inner, id) else {
                not_authenticated(inner, id);
                return Ok(());
            };
            let mut state = lock(&inner.state);
            let sender_email = p.sender_email.trim().to_string();
            if sender_email.is_empty() {
                deny_all(&mut state, &owner);
                return Ok(());
            }

            let entry = state
                .transfer_requests
                .get_mut(&owner)
                .and_then(|senders| senders.remove(&sender_email));
            if entry.is_none() {
                reply_status(&state, id, "No pending request from that sender.");
                return Ok(());
            }
            if state
                .transfer_requests
                .get(&owner)
                .is_some_and(BTreeMap::is_empty)
            {
                state.transfer_requests.remove(&owner);
            }
            let Some(&sender_session) = state.email_to_session.get(&sender_email) else {
                reply_status(&state, id, "User is not online.");
                return Ok(());
            };

            let token = crypto::make_token();
            state.rendezvous.insert(
                id,
                Rendezvous {
                    token: token.clone(),
                    sender: sender_session,
                },
            );
            send_to(&state, id, Tag::Token, &TokenPayload { token });
        }
        Tag::SendPort => {
            let p: SendPortPayload = frame::decode(tag, payload)?;
            if session_email(inner, id).is_none() {
                not_authenticated(inner, id);
                return Ok(());
            }
            let mut state = lock(&inner.state);
            if let Some(rendezvous) = state.rendezvous.remove(&id) {
                send_to(
                    &state,
                    rendezvous.sender,
                    Tag::PortToken,
                    &PortTokenPayload {
                        port: p.port,
                        token: rendezvous.token,
                    },
                );
            } else {
                warn!("Session {id} sent a port with no transfer awaiting one");
            }
        }
        // Server-to-client tags arriving here are peer misbehavior.
        Tag::Status | Tag::Contacts | Tag::PendingRequests | Tag::Token | Tag::PortToken
        | Tag::FileInfo | Tag::Chunk => {
            return Err(Error::Protocol(format!(
                "unexpected {} frame on a coordination session",
                String::from_utf8_lossy(tag.as_bytes())
            )));
        }
    }
    Ok(())
}

/// Bind an authenticated email to this session. At most one live
/// session per email.
fn bind_session(state: &mut State, id: SessionId, email: &str) -> String {
    match state.email_to_session.get(email) {
        Some(&existing) if existing == id => String::new(),
        Some(_) => "User is already logged in.".into(),
        None => {
            if let Some(previous) = state.sessions.get(&id).and_then(|s| s.email.clone()) {
                state.email_to_session.remove(&previous);
            }
            state.email_to_session.insert(email.to_string(), id);
            if let Some(session) = state.sessions.get_mut(&id) {
                session.email = Some(email.to_string());
            }
            String::new()
        }
    }
}

/// Deny every pending request for `recipient`: each enqueued sender
/// gets `FTPT {port: 0, token: ""}` and the queue is cleared.
fn deny_all(state: &mut State, recipient: &str) {
    let Some(pending) = state.transfer_requests.remove(recipient) else {
        return;
    };
    for sender_email in pending.keys() {
        if let Some(&sender_session) = state.email_to_session.get(sender_email) {
            send_to(
                state,
                sender_session,
                Tag::PortToken,
                &PortTokenPayload {
                    port: 0,
                    token: String::new(),
                },
            );
        }
    }
}

/// Remove every trace of a closed session: bindings, the in-memory
/// plaintext email on its account, pending requests it sent or was to
/// receive, and rendezvous records naming it.
fn teardown(inner: &Inner, id: SessionId) {
    let email = lock(&inner.state)
        .sessions
        .get(&id)
        .and_then(|s| s.email.clone());
    if let Some(email) = &email {
        lock(&inner.store).scrub(email);
    }

    let mut state = lock(&inner.state);
    state.sessions.remove(&id);
    if let Some(email) = &email {
        if state.email_to_session.get(email) == Some(&id) {
            state.email_to_session.remove(email);
        }
        state.transfer_requests.remove(email);
        state.transfer_requests.retain(|_, senders| {
            senders.remove(email);
            !senders.is_empty()
        });
    }
    state
        .rendezvous
        .retain(|&recipient, rendezvous| recipient != id && rendezvous.sender != id);
}

fn session_email(inner: &Inner, id: SessionId) -> Option<String> {
    lock(&inner.state).sessions.get(&id).and_then(|s| s.email.clone())
}

fn not_authenticated(inner: &Inner, id: SessionId) {
    reply_status(&lock(&inner.state), id, "Not authenticated.");
}

/// Queue a frame for delivery on a session's writer task. A closed or
/// unknown session drops the frame; teardown handles the rest.
fn send_to<T: Serialize>(state: &State, id: SessionId, tag: Tag, payload: &T) {
    let Some(session) = state.sessions.get(&id) else {
        return;
    };
    match frame::encode(tag, payload) {
        Ok(bytes) => {
            let _ = session.tx.send(bytes);
        }
        Err(e) => warn!("Failed to encode {:?} frame: {e}", tag),
    }
}

fn reply_status(state: &State, id: SessionId, message: &str) {
    send_to(
        state,
        id,
        Tag::Status,
        &StatusPayload {
            message: message.to_string(),
        },
    );
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SENTINEL;

    /// An `Inner` with a scratch account store, no listener attached.
    fn test_inner(dir: &tempfile::TempDir) -> Inner {
        Inner {
            store: Mutex::new(AccountStore::open(dir.path().join("server.json")).unwrap()),
            state: Mutex::new(State::default()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Register a live, authenticated session at `remote` and return
    /// the receiving end of its writer channel.
    fn add_session(
        inner: &Inner,
        id: SessionId,
        remote: &str,
        email: &str,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&inner.state);
        state.sessions.insert(
            id,
            Session {
                tx,
                remote: remote.parse().unwrap(),
                email: Some(email.to_string()),
            },
        );
        state.email_to_session.insert(email.to_string(), id);
        rx
    }

    /// Pop the next queued frame and decode it as a `STAT`.
    fn status_reply(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> String {
        let bytes = rx.try_recv().expect("a queued reply frame");
        assert_eq!(&bytes[..4], Tag::Status.as_bytes());
        let payload = &bytes[4..bytes.len() - SENTINEL.len()];
        let status: StatusPayload = serde_json::from_slice(payload).unwrap();
        status.message
    }

    fn transfer_request(recipient_email: &str) -> Vec<u8> {
        serde_json::to_vec(&TransferRequestPayload {
            recipient_email: recipient_email.to_string(),
            file_info: FileInfo {
                name: "a.txt".into(),
                size: 1,
                sha256: "00".repeat(32),
            },
        })
        .unwrap()
    }

    fn register_pair(inner: &Inner) {
        let mut store = lock(&inner.store);
        assert_eq!(store.register("Alice", "alice@example.com", "password_v12"), "");
        assert_eq!(store.register("Bob", "bob@example.com", "password_v12"), "");
        assert_eq!(
            store.add_contact("bob@example.com", "Alice", "alice@example.com"),
            ""
        );
    }

    #[test]
    fn cross_network_transfer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);
        register_pair(&inner);
        let mut alice_rx = add_session(&inner, 1, "192.168.0.2:50000", "alice@example.com");
        let _bob_rx = add_session(&inner, 2, "192.168.0.3:50000", "bob@example.com");

        handle_frame(&inner, 1, Tag::TransferRequest, &transfer_request("bob@example.com"))
            .unwrap();

        assert_eq!(
            status_reply(&mut alice_rx),
            "Sender and recipient are not on the same network."
        );
        assert!(lock(&inner.state).transfer_requests.is_empty());
    }

    #[test]
    fn same_network_transfer_is_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);
        register_pair(&inner);
        // Same IP, different ports: two peers behind one address.
        let mut alice_rx = add_session(&inner, 1, "192.168.0.2:50000", "alice@example.com");
        let _bob_rx = add_session(&inner, 2, "192.168.0.2:50001", "bob@example.com");

        handle_frame(&inner, 1, Tag::TransferRequest, &transfer_request("bob@example.com"))
            .unwrap();

        assert_eq!(status_reply(&mut alice_rx), "");
        let state = lock(&inner.state);
        let pending = state.transfer_requests.get("bob@example.com").unwrap();
        assert_eq!(pending.get("alice@example.com").unwrap().name, "a.txt");
    }

    #[test]
    fn self_transfer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = test_inner(&dir);
        register_pair(&inner);
        let mut alice_rx = add_session(&inner, 1, "192.168.0.2:50000", "alice@example.com");

        handle_frame(
            &inner,
            1,
            Tag::TransferRequest,
            &transfer_request("alice@example.com"),
        )
        .unwrap();

        assert_eq!(status_reply(&mut alice_rx), "Cannot send a file to yourself.");
        assert!(lock(&inner.state).transfer_requests.is_empty());
        assert!(lock(&inner.state).rendezvous.is_empty());
    }
}
