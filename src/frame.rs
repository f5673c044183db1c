//! Wire framing for the coordination and transfer protocols
//!
//! Every message is a 4-byte ASCII type tag followed by a JSON payload
//! and terminated by the two-byte sentinel `\n\n`. JSON strings encode
//! newlines as `\n` escapes, so the payload can never contain a raw
//! newline and the sentinel is unambiguous.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame terminator.
pub const SENTINEL: &[u8; 2] = b"\n\n";

/// The 4-byte message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `RGTR` -- register a new account.
    Register,
    /// `LGIN` -- authenticate an existing account.
    Login,
    /// `STAT` -- status reply; empty message means success.
    Status,
    /// `ADDC` -- add a contact to the caller's contact map.
    AddContact,
    /// `LCPN` -- list online mutual contacts.
    ListContacts,
    /// `LCRN` -- contact listing reply.
    Contacts,
    /// `FTRP` -- sender requests a transfer to a recipient.
    TransferRequest,
    /// `FTCR` -- recipient polls for pending transfer requests.
    CheckRequests,
    /// `FTRR` -- pending transfer requests reply.
    PendingRequests,
    /// `FTAR` -- recipient accepts one request or denies all.
    AcceptRequest,
    /// `FTEA` -- transfer token issued to the recipient.
    Token,
    /// `FTSP` -- recipient reports its listener port.
    SendPort,
    /// `FTPT` -- port and token forwarded to the sender; an empty
    /// token means the request was denied.
    PortToken,
    /// `FTPF` -- first frame of the peer-to-peer stream: file info
    /// plus the transfer token.
    FileInfo,
    /// `FTPC` -- one base64 file chunk on the peer-to-peer stream.
    Chunk,
}

impl Tag {
    /// The exact wire bytes of this tag.
    #[must_use]
    pub const fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Self::Register => b"RGTR",
            Self::Login => b"LGIN",
            Self::Status => b"STAT",
            Self::AddContact => b"ADDC",
            Self::ListContacts => b"LCPN",
            Self::Contacts => b"LCRN",
            Self::TransferRequest => b"FTRP",
            Self::CheckRequests => b"FTCR",
            Self::PendingRequests => b"FTRR",
            Self::AcceptRequest => b"FTAR",
            Self::Token => b"FTEA",
            Self::SendPort => b"FTSP",
            Self::PortToken => b"FTPT",
            Self::FileInfo => b"FTPF",
            Self::Chunk => b"FTPC",
        }
    }

    /// Parse a tag from its wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: &[u8; 4]) -> Option<Self> {
        match bytes {
            b"RGTR" => Some(Self::Register),
            b"LGIN" => Some(Self::Login),
            b"STAT" => Some(Self::Status),
            b"ADDC" => Some(Self::AddContact),
            b"LCPN" => Some(Self::ListContacts),
            b"LCRN" => Some(Self::Contacts),
            b"FTRP" => Some(Self::TransferRequest),
            b"FTCR" => Some(Self::CheckRequests),
            b"FTRR" => Some(Self::PendingRequests),
            b"FTAR" => Some(Self::AcceptRequest),
            b"FTEA" => Some(Self::Token),
            b"FTSP" => Some(Self::SendPort),
            b"FTPT" => Some(Self::PortToken),
            b"FTPF" => Some(Self::FileInfo),
            b"FTPC" => Some(Self::Chunk),
            _ => None,
        }
    }
}

// ── Payloads ───────────────────────────────────────────────────────

/// `RGTR` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// `LGIN` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

/// `STAT` payload. An empty `message` signals success; anything else
/// is the error text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub message: String,
}

impl StatusPayload {
    /// The success status.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            message: String::new(),
        }
    }

    /// A failure status carrying `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.message.is_empty()
    }
}

/// `ADDC` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddContactPayload {
    pub name: String,
    pub email: String,
}

/// `LCPN` payload (empty object).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListContactsPayload {}

/// `LCRN` payload: `email -> display name` of online mutual contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactsPayload {
    pub contacts: BTreeMap<String, String>,
}

/// File metadata carried on the coordination session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// `FTRP` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequestPayload {
    pub recipient_email: String,
    pub file_info: FileInfo,
}

/// `FTCR` payload (empty object).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRequestsPayload {}

/// `FTRR` payload: `sender email -> file info` for every pending
/// request addressed to the polling recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRequestsPayload {
    pub requests: BTreeMap<String, FileInfo>,
}

/// `FTAR` payload. An empty `sender_email` denies every pending
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequestPayload {
    pub sender_email: String,
}

/// `FTEA` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
}

/// `FTSP` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPortPayload {
    pub port: u16,
}

/// `FTPT` payload. `token == ""` means the recipient denied the
/// request; `port` is `0` in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortTokenPayload {
    pub port: u16,
    pub token: String,
}

/// File metadata carried on the peer-to-peer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pFileInfo {
    pub name: String,
    pub chunks: u32,
    #[serde(rename = "SHA256")]
    pub sha256: String,
}

/// `FTPF` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pFileInfoPayload {
    pub file_info: P2pFileInfo,
    pub token: String,
}

/// `FTPC` payload: one base64-encoded file chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk: String,
}

// ── Encoding and I/O ───────────────────────────────────────────────

/// Serialize a frame to its wire bytes (tag, JSON payload, sentinel).
pub fn encode<T: Serialize>(tag: Tag, payload: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    let mut bytes = Vec::with_capacity(4 + json.len() + SENTINEL.len());
    bytes.extend_from_slice(tag.as_bytes());
    bytes.extend_from_slice(&json);
    bytes.extend_from_slice(SENTINEL);
    Ok(bytes)
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, tag: Tag, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(tag, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame: consume up to and including the sentinel, strip
/// it, and split off the tag.
///
/// Returns `Ok(None)` on a clean end of stream. An unknown tag or a
/// frame shorter than a tag yields [`Error::Protocol`]; the sentinel
/// has already been consumed, so the caller may keep reading.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(Tag, Vec<u8>)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(Error::Protocol("stream ended mid-frame".into()));
    }
    // The payload is JSON and cannot contain a raw newline, so the
    // first newline starts the sentinel. The next byte must finish it.
    let second = reader.read_u8().await.map_err(|_| {
        Error::Protocol("stream ended inside the frame sentinel".into())
    })?;
    if second != b'\n' {
        return Err(Error::Protocol("missing frame sentinel".into()));
    }
    buf.pop();

    if buf.len() < 4 {
        return Err(Error::Protocol(format!("short frame ({} bytes)", buf.len())));
    }
    let tag_bytes: [u8; 4] = buf[..4].try_into().map_err(|_| {
        Error::Protocol("unreadable frame tag".into())
    })?;
    let Some(tag) = Tag::from_bytes(&tag_bytes) else {
        return Err(Error::Protocol(format!(
            "unknown tag {:?}",
            String::from_utf8_lossy(&tag_bytes)
        )));
    };
    Ok(Some((tag, buf.split_off(4))))
}

/// Deserialize a frame payload, mapping malformed JSON to
/// [`Error::Protocol`].
pub fn decode<T: DeserializeOwned>(tag: Tag, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        Error::Protocol(format!(
            "malformed {} payload: {e}",
            String::from_utf8_lossy(tag.as_bytes())
        ))
    })
}
