#![allow(clippy::similar_names)]

//! End-to-end tests against a live Coordinator.
//!
//! Each test starts a fresh Coordinator with empty state on an
//! ephemeral port, connects one `Client` per user, and exercises the
//! full flows: registration, login, contacts, and brokered
//! peer-to-peer transfers.

mod util;

use securedrop::frame::FileInfo;
use securedrop::store::INVALID_CREDENTIALS;
use securedrop::{Client, Error, Progress, Receiver, crypto, tls};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use util::{connect, start_coordinator};

const PASSWORD: &str = "password_v12";

async fn register(client: &mut Client, name: &str, email: &str) {
    let message = client.register(name, email, PASSWORD).await.unwrap();
    assert_eq!(message, "", "registration of {email} failed: {message}");
}

/// Poll until the recipient sees at least one pending request.
async fn poll_until_pending(client: &mut Client) -> BTreeMap<String, FileInfo> {
    for _ in 0..100 {
        let requests = client.poll_requests().await.unwrap();
        if !requests.is_empty() {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no pending request arrived");
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_registration_and_login() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;

    // The account file holds exactly one record, keyed by the SHA-256
    // of the literal email, with no plaintext anywhere.
    let data = std::fs::read_to_string(&coordinator.state_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
    let hash = crypto::email_hash("alice@example.com");
    let records = parsed.as_object().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[&hash]["email"], serde_json::json!(hash));
    assert!(!data.contains("alice@example.com"));
    assert!(!data.contains("Alice"));

    // Free the session binding, then log in again.
    drop(alice);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut again = connect(&coordinator).await;
    assert_eq!(again.login("alice@example.com", PASSWORD).await.unwrap(), "");
    drop(again);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut wrong = connect(&coordinator).await;
    assert_eq!(
        wrong.login("alice@example.com", "password_v13").await.unwrap(),
        INVALID_CREDENTIALS
    );
    assert_eq!(
        wrong.login("nobody@example.com", PASSWORD).await.unwrap(),
        INVALID_CREDENTIALS
    );
}

#[tokio::test]
async fn test_duplicate_registration() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;

    let mut imposter = connect(&coordinator).await;
    assert_eq!(
        imposter
            .register("Imposter", "alice@example.com", "password_v13")
            .await
            .unwrap(),
        "User already exists."
    );
}

#[tokio::test]
async fn test_second_login_is_rejected_while_first_session_lives() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;

    let mut twin = connect(&coordinator).await;
    assert_eq!(
        twin.login("alice@example.com", PASSWORD).await.unwrap(),
        "User is already logged in."
    );
}

#[tokio::test]
async fn test_commands_require_authentication() {
    let coordinator = start_coordinator().await;

    let mut stranger = connect(&coordinator).await;
    assert_eq!(
        stranger.add_contact("Bob", "bob@example.com").await.unwrap(),
        "Not authenticated."
    );
}

#[tokio::test]
async fn test_mutual_online_contacts() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;

    // One-sided add is invisible to both parties.
    assert_eq!(alice.add_contact("Bob", "bob@example.com").await.unwrap(), "");
    assert!(alice.list_contacts().await.unwrap().is_empty());
    assert!(bob.list_contacts().await.unwrap().is_empty());

    assert_eq!(bob.add_contact("Alice", "alice@example.com").await.unwrap(), "");
    let contacts = alice.list_contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts.get("bob@example.com").map(String::as_str), Some("Bob"));

    // Bob disconnecting empties Alice's online listing.
    drop(bob);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice.list_contacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transfer_to_non_contact_is_rejected() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;

    let path = write_file(coordinator.dir.path(), "note.txt", b"ten bytes!");
    let progress = Progress::new();
    let err = alice
        .send_file("bob@example.com", &path, &progress)
        .await
        .unwrap_err();
    match err {
        Error::Transfer(message) => assert_eq!(
            message,
            "User [alice@example.com] has not added you as a contact"
        ),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_self_transfer_is_rejected() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    // Even with herself in her own contact map the request is refused.
    assert_eq!(
        alice.add_contact("Alice", "alice@example.com").await.unwrap(),
        ""
    );

    let path = write_file(coordinator.dir.path(), "mirror.txt", b"ten bytes!");
    let progress = Progress::new();
    let err = alice
        .send_file("alice@example.com", &path, &progress)
        .await
        .unwrap_err();
    match err {
        Error::Transfer(message) => assert_eq!(message, "Cannot send a file to yourself."),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_transfer_to_offline_recipient_is_rejected() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let bob = connect(&coordinator).await;
    drop(bob);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let message = alice
        .request_transfer(
            "bob@example.com",
            FileInfo {
                name: "note.txt".into(),
                size: 10,
                sha256: crypto::email_hash("x"),
            },
        )
        .await
        .unwrap();
    assert_eq!(message, "User is not online.");
}

/// Run one brokered transfer end to end and return
/// `(sent_path, received_path, receiver_progress_snapshot)`.
async fn brokered_transfer(contents: &[u8], file_name: &str) -> (Vec<u8>, Vec<u8>, (u32, u32)) {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;
    assert_eq!(alice.add_contact("Bob", "bob@example.com").await.unwrap(), "");
    assert_eq!(bob.add_contact("Alice", "alice@example.com").await.unwrap(), "");

    let src_dir = coordinator.dir.path().join("src");
    let out_dir = coordinator.dir.path().join("out");
    std::fs::create_dir_all(&src_dir).unwrap();
    std::fs::create_dir_all(&out_dir).unwrap();
    let src_path = write_file(&src_dir, file_name, contents);

    let send_progress = Progress::new();
    let sender = {
        let src_path = src_path.clone();
        let progress = send_progress.clone();
        tokio::spawn(
            async move { alice.send_file("bob@example.com", &src_path, &progress).await },
        )
    };

    let requests = poll_until_pending(&mut bob).await;
    let info = requests.get("alice@example.com").expect("request from alice");
    assert_eq!(info.name, file_name);
    assert_eq!(info.size, contents.len() as u64);

    let token = bob.accept_transfer("alice@example.com").await.unwrap();
    assert_eq!(token.len(), 64);

    let acceptor = tls::acceptor_from_pem(&coordinator.cert_path).unwrap();
    let recv_progress = Progress::new();
    let receiver = Receiver::bind(acceptor, token, &out_dir, recv_progress.clone())
        .await
        .unwrap();
    bob.send_port(receiver.port()).await.unwrap();

    let out_path = receiver.run().await.unwrap();
    sender.await.unwrap().unwrap();

    let sent = std::fs::read(&src_path).unwrap();
    let received = std::fs::read(&out_path).unwrap();
    (sent, received, recv_progress.snapshot())
}

#[tokio::test]
async fn test_small_file_transfer() {
    let (sent, received, progress) = brokered_transfer(b"hello\nworld", "hello.txt").await;
    assert_eq!(sent, received);
    assert_eq!(progress, (1, 1));
}

#[tokio::test]
async fn test_five_mebibyte_transfer() {
    use rand::RngCore;
    let mut contents = vec![0u8; 5 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut contents);

    let (sent, received, progress) = brokered_transfer(&contents, "random.bin").await;
    assert_eq!(sent, received);
    // ceil(5 MiB / 4096) chunks.
    assert_eq!(progress, (1280, 1280));
}

#[tokio::test]
async fn test_denied_transfer() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;
    assert_eq!(alice.add_contact("Bob", "bob@example.com").await.unwrap(), "");
    assert_eq!(bob.add_contact("Alice", "alice@example.com").await.unwrap(), "");

    let path = write_file(coordinator.dir.path(), "secret.txt", b"not today!");
    let progress = Progress::new();
    let sender = tokio::spawn(async move {
        alice.send_file("bob@example.com", &path, &progress).await
    });

    poll_until_pending(&mut bob).await;
    bob.deny_all().await.unwrap();

    match sender.await.unwrap().unwrap_err() {
        Error::Transfer(message) => assert_eq!(message, "User declined"),
        other => panic!("unexpected error: {other}"),
    }
    // The queue was cleared.
    assert!(bob.poll_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reenqueued_request_replaces_previous() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;
    assert_eq!(bob.add_contact("Alice", "alice@example.com").await.unwrap(), "");

    for (name, size) in [("first.txt", 10), ("second.txt", 20)] {
        let message = alice
            .request_transfer(
                "bob@example.com",
                FileInfo {
                    name: name.into(),
                    size,
                    sha256: crypto::email_hash(name),
                },
            )
            .await
            .unwrap();
        assert_eq!(message, "");
    }

    let requests = bob.poll_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests["alice@example.com"].name, "second.txt");
    assert_eq!(requests["alice@example.com"].size, 20);
}

#[tokio::test]
async fn test_sender_disconnect_garbage_collects_request() {
    let coordinator = start_coordinator().await;

    let mut alice = connect(&coordinator).await;
    register(&mut alice, "Alice", "alice@example.com").await;
    let mut bob = connect(&coordinator).await;
    register(&mut bob, "Bob", "bob@example.com").await;
    assert_eq!(bob.add_contact("Alice", "alice@example.com").await.unwrap(), "");

    let message = alice
        .request_transfer(
            "bob@example.com",
            FileInfo {
                name: "gone.txt".into(),
                size: 1,
                sha256: crypto::email_hash("gone"),
            },
        )
        .await
        .unwrap();
    assert_eq!(message, "");
    assert_eq!(bob.poll_requests().await.unwrap().len(), 1);

    drop(alice);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.poll_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_hundred_concurrent_sessions() {
    let coordinator = start_coordinator().await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let config = util::client_config(&coordinator);
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(config).await.unwrap();
            let email = format!("user{i}@example.com");
            let message = client
                .register(&format!("User {i}"), &email, "password_v12")
                .await
                .unwrap();
            assert_eq!(message, "");
            // Exercise the request/response path on every session.
            assert!(client.poll_requests().await.unwrap().is_empty());
            assert!(client.list_contacts().await.unwrap().is_empty());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
