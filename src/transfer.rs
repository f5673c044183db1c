//! Peer-to-peer transfer protocol
//!
//! Once the Coordinator has handed both parties `{port, token}`, the
//! recipient listens on an ephemeral TLS port and the sender dials it.
//! The first frame must be `FTPF` carrying the file metadata and the
//! token; the receiver closes on a token mismatch. File bytes then
//! stream as base64 `FTPC` chunks, and the receiver answers with one
//! final `STAT` after verifying the SHA-256 of what it wrote. The
//! Coordinator is not on this path.
//!
//! Any framing error, token mismatch, short read, or disconnect
//! terminates the transfer; the partial output file is left on disk.

use crate::crypto;
use crate::error::{Error, Result};
use crate::frame::{self, ChunkPayload, P2pFileInfo, P2pFileInfoPayload, StatusPayload, Tag};
use crate::tls;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// File bytes per chunk before base64 encoding.
pub const CHUNK_SIZE: usize = 4096;

/// Shared chunk counters read by the UI while a transfer runs.
///
/// Readers only ever see a torn pair momentarily; both fields are
/// rewritten on every chunk.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicU32,
    total: AtomicU32,
}

impl Progress {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, done: u32, total: u32) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    /// `(done_chunks, total_chunks)` as last written.
    #[must_use]
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Whether the transfer has written every expected chunk.
    #[must_use]
    pub fn complete(&self) -> bool {
        let (done, total) = self.snapshot();
        done == total && total > 0
    }
}

/// The receiving end of one transfer: an ephemeral TLS listener that
/// accepts exactly one connection.
pub struct Receiver {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    token: String,
    out_dir: PathBuf,
    progress: Arc<Progress>,
    port: u16,
}

impl Receiver {
    /// Bind `0.0.0.0:0`; the OS-chosen port is reported to the
    /// Coordinator via `FTSP` by the caller.
    pub async fn bind(
        acceptor: TlsAcceptor,
        token: String,
        out_dir: impl Into<PathBuf>,
        progress: Arc<Progress>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            acceptor,
            token,
            out_dir: out_dir.into(),
            progress,
            port,
        })
    }

    /// The port the receiver is listening on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Accept one sender and run the transfer to completion. Returns
    /// the path of the written file.
    ///
    /// The output file must not exist beforehand; it is created empty
    /// and written append-only. On any failure the partial file is
    /// left on disk.
    pub async fn run(self) -> Result<PathBuf> {
        let Self {
            listener,
            acceptor,
            token,
            out_dir,
            progress,
            ..
        } = self;

        let (tcp, peer) = listener.accept().await?;
        // Exactly one connection; no second sender can race in.
        drop(listener);
        debug!("Receiver accepted connection from {peer}");
        let tls_stream = acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut stream = BufReader::new(tls_stream);

        let Some((tag, payload)) = frame::read_frame(&mut stream).await? else {
            return Err(Error::Transfer("Peer closed before sending file info".into()));
        };
        if tag != Tag::FileInfo {
            return Err(Error::Protocol("First frame must be file info".into()));
        }
        let info: P2pFileInfoPayload = frame::decode(tag, &payload)?;
        if info.token != token {
            return Err(Error::Transfer("Transfer token mismatch".into()));
        }

        let file_name = Path::new(&info.file_info.name)
            .file_name()
            .ok_or_else(|| Error::Transfer("Invalid file name".into()))?;
        let out_path = out_dir.join(file_name);
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&out_path)
            .await
            .map_err(|e| {
                Error::Transfer(format!("Cannot create {}: {e}", out_path.display()))
            })?;

        let total = info.file_info.chunks;
        progress.set(0, total);
        let mut received: u32 = 0;
        while received < total {
            let Some((tag, payload)) = frame::read_frame(&mut stream).await? else {
                return Err(Error::Transfer("Peer closed mid-transfer".into()));
            };
            if tag != Tag::Chunk {
                return Err(Error::Protocol(format!(
                    "Expected a chunk frame, got {}",
                    String::from_utf8_lossy(tag.as_bytes())
                )));
            }
            let chunk: ChunkPayload = frame::decode(tag, &payload)?;
            let bytes = BASE64
                .decode(chunk.chunk)
                .map_err(|_| Error::Transfer("Invalid base64 chunk".into()))?;
            file.write_all(&bytes).await?;
            received += 1;
            progress.set(received, total);
        }
        file.flush().await?;
        drop(file);

        let actual = crypto::sha256_file(&out_path)?;
        let message = if actual == info.file_info.sha256 {
            String::new()
        } else {
            "File hashes don't match!".to_string()
        };
        frame::write_frame(
            stream.get_mut(),
            Tag::Status,
            &StatusPayload {
                message: message.clone(),
            },
        )
        .await?;
        stream.get_mut().shutdown().await.ok();

        if message.is_empty() {
            info!("Received {} ({} chunks)", out_path.display(), total);
            Ok(out_path)
        } else {
            Err(Error::Transfer(message))
        }
    }
}

/// Dial the receiver and stream a file: `FTPF`, then one `FTPC` per
/// 4096-byte chunk, then await the receiver's final `STAT`.
pub async fn send_file(
    host: &str,
    port: u16,
    token: &str,
    path: &Path,
    progress: &Arc<Progress>,
) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Transfer("Invalid file name".into()))?
        .to_string();
    let size = tokio::fs::metadata(path).await?.len();
    let sha256 = crypto::sha256_file(path)?;
    let chunks = u32::try_from(size.div_ceil(CHUNK_SIZE as u64))
        .map_err(|_| Error::Transfer("File too large".into()))?;

    let tls_stream = tls::connect(host, port).await?;
    let mut stream = BufReader::new(tls_stream);
    frame::write_frame(
        stream.get_mut(),
        Tag::FileInfo,
        &P2pFileInfoPayload {
            file_info: P2pFileInfo {
                name,
                chunks,
                sha256,
            },
            token: token.to_string(),
        },
    )
    .await?;
    progress.set(0, chunks);

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u32 = 0;
    loop {
        let n = read_full(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        frame::write_frame(
            stream.get_mut(),
            Tag::Chunk,
            &ChunkPayload {
                chunk: BASE64.encode(&buf[..n]),
            },
        )
        .await?;
        sent += 1;
        progress.set(sent, chunks);
    }

    let Some((tag, payload)) = frame::read_frame(&mut stream).await? else {
        return Err(Error::Transfer("Peer closed without a final status".into()));
    };
    if tag != Tag::Status {
        return Err(Error::Protocol(format!(
            "Expected a status frame, got {}",
            String::from_utf8_lossy(tag.as_bytes())
        )));
    }
    let status: StatusPayload = frame::decode(tag, &payload)?;
    if status.is_ok() {
        info!("Sent {} ({sent} chunks)", path.display());
        Ok(())
    } else {
        Err(Error::Transfer(status.message))
    }
}

/// Fill `buf` as far as the file allows; a short count only happens at
/// the end of the file.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
