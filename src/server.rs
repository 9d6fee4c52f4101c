//! The SANFT server.
//!
//! One accept loop receives datagrams, classifies them, and spawns a task
//! per accepted request, so a slow paced ACR stream never blocks another
//! peer. Shared state is the fileID registry and the token minter; both sit
//! behind async mutexes and are only held for short, await-free sections.

use crate::base::{chunk_count, chunk_span};
use crate::config::ServerConfig;
use crate::error::SanftError;
use crate::file_io;
use crate::markov::MarkovSocket;
use crate::registry::FileRegistry;
use crate::token::TokenMinter;
use crate::wire::{self, Acr, ClientMessage, Crr, Mdr, Mdrr, Ntm, ServerHeader, WireError};
use bytes::Bytes;
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// How often the accept loop wakes up to poll the shutdown signal.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Serves files below a root directory to SANFT clients.
#[derive(Clone)]
pub struct Server {
    socket: Arc<MarkovSocket>,
    config: Arc<ServerConfig>,
    registry: Arc<Mutex<FileRegistry>>,
    minter: Arc<Mutex<TokenMinter>>,
}

impl Server {
    /// Validates the configuration and binds the UDP socket.
    pub async fn bind(config: ServerConfig) -> Result<Self, SanftError> {
        config.validate()?;
        let socket = UdpSocket::bind((config.address.as_str(), config.port)).await?;
        let socket = MarkovSocket::new(socket, config.loss_p, config.loss_q);
        Ok(Self {
            socket: Arc::new(socket),
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(FileRegistry::new())),
            minter: Arc::new(Mutex::new(TokenMinter::new())),
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> Result<SocketAddr, SanftError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives and dispatches requests until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), SanftError> {
        info!(
            address = %self.local_addr()?,
            root = %self.config.root_dir.display(),
            chunk_size = self.config.chunk_size,
            "server listening"
        );
        let mut buf = vec![0u8; wire::MAX_DATAGRAM];
        while !*shutdown.borrow() {
            self.minter.lock().await.refresh();

            // Short receive timeout to stay responsive to the stop signal.
            let (len, peer) = match timeout(SHUTDOWN_POLL, self.socket.recv_from(&mut buf)).await
            {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "error while receiving from UDP socket");
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            match wire::parse_client(&buf[..len]) {
                Ok(ClientMessage::Mdr(mdr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_mdr(mdr, peer).await {
                            error!(peer = %peer, error = %e, "error handling metadata request");
                        }
                    });
                }
                Ok(ClientMessage::Acr(acr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_acr(acr, peer).await {
                            error!(peer = %peer, error = %e, "error handling chunk request");
                        }
                    });
                }
                Err(WireError::UnsupportedVersion { version, kind, number }) => {
                    debug!(peer = %peer, version, "unsupported version, echoing error header");
                    let reply = ServerHeader { kind, number, error: wire::UNSUPPORTED_VERSION };
                    if let Err(e) = self.socket.send_to(&reply.encode(), peer).await {
                        warn!(peer = %peer, error = %e, "error while sending version reply");
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "dropping invalid datagram");
                }
            }
        }
        info!("server stopped");
        Ok(())
    }

    async fn handle_mdr(&self, mdr: Mdr, peer: SocketAddr) -> Result<(), SanftError> {
        info!(peer = %peer, uri = %mdr.uri, "metadata request");

        if !self.minter.lock().await.check(&peer, &mdr.token) {
            debug!(peer = %peer, "invalid token in MDR, sending new token");
            return self.send_ntm(mdr.number, peer).await;
        }

        let Some(path) = resolve_uri(&self.config.root_dir, &mdr.uri) else {
            debug!(peer = %peer, uri = %mdr.uri, "URI does not resolve under the root");
            return self.reply_error(wire::MDRR_T, mdr.number, wire::FILE_NOT_FOUND, peer).await;
        };
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                debug!(peer = %peer, uri = %mdr.uri, "URI does not exist");
                return self
                    .reply_error(wire::MDRR_T, mdr.number, wire::FILE_NOT_FOUND, peer)
                    .await;
            }
        };

        let file_size = chunk_count(meta.len(), self.config.chunk_size);
        if file_size > wire::MAX_U48 {
            // Too large for a 48-bit chunk count; projected as not serveable.
            warn!(path = %path.display(), "file too large to serve");
            return self.reply_error(wire::MDRR_T, mdr.number, wire::FILE_NOT_FOUND, peer).await;
        }

        let mtime = meta.modified()?;
        let assigned = self.registry.lock().await.assign(&path, mtime);
        let (file_id, checksum) = match assigned {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not assign a file ID");
                return Ok(());
            }
        };

        let reply = Mdrr {
            number: mdr.number,
            chunk_size: self.config.chunk_size,
            max_chunks_in_acr: self.config.max_chunks_in_acr,
            file_id,
            file_size,
            checksum,
        };
        self.socket.send_to(&reply.encode(), peer).await?;
        Ok(())
    }

    async fn handle_acr(&self, acr: Acr, peer: SocketAddr) -> Result<(), SanftError> {
        info!(
            peer = %peer,
            file_id = acr.file_id,
            packet_rate = acr.packet_rate,
            crs = acr.crs.len(),
            "chunk request"
        );

        if !self.minter.lock().await.check(&peer, &acr.token) {
            debug!(peer = %peer, "invalid token in ACR, sending new token");
            return self.send_ntm(acr.number, peer).await;
        }

        let path = {
            let mut registry = self.registry.lock().await;
            match registry.get(acr.file_id) {
                None => None,
                Some(entry) => {
                    let path = entry.path.clone();
                    let unchanged = std::fs::metadata(&path)
                        .ok()
                        .filter(|meta| meta.is_file())
                        .and_then(|meta| meta.modified().ok())
                        .is_some_and(|observed| observed == entry.mtime);
                    if unchanged {
                        Some(path)
                    } else {
                        // Deleted or modified since the MDRR went out.
                        registry.remove(acr.file_id);
                        None
                    }
                }
            }
        };
        let Some(path) = path else {
            debug!(peer = %peer, file_id = acr.file_id, "file ID is not (or no longer) valid");
            return self.reply_error(wire::CRR_T, acr.number, wire::INVALID_FILE_ID, peer).await;
        };

        let file = File::open(&path)?;
        let file_bytes = file.metadata()?.len();
        let file_size = chunk_count(file_bytes, self.config.chunk_size);

        let rate = (f64::from(acr.packet_rate) + f64::from(self.config.rate_increase)).max(1.0);
        let delta_t = Duration::from_secs_f64(1.0 / rate);

        let mut sent_chunks: u32 = 0;
        for cr in &acr.crs {
            if cr.length == 0 {
                debug!(peer = %peer, offset = cr.offset, "zero-length chunk request");
                self.reply_error(wire::CRR_T, acr.number, wire::ZERO_LENGTH_CR, peer).await?;
                continue;
            }
            for step in 0..u64::from(cr.length) {
                let chunk_number = cr.offset + step;
                sent_chunks += 1;
                if sent_chunks > u32::from(self.config.max_chunks_in_acr) {
                    debug!(peer = %peer, "too many chunks requested");
                    return self
                        .reply_error(wire::CRR_T, acr.number, wire::TOO_MANY_CHUNKS, peer)
                        .await;
                }
                if chunk_number >= file_size {
                    debug!(peer = %peer, chunk = chunk_number, "chunk request out of bounds");
                    let reply = Crr {
                        number: acr.number,
                        error: wire::CHUNK_OUT_OF_BOUNDS,
                        chunk_number,
                        data: Bytes::new(),
                    };
                    self.socket.send_to(&reply.encode(), peer).await?;
                    break;
                }

                let (offset, len) = chunk_span(chunk_number, file_bytes, self.config.chunk_size);
                let mut data = vec![0u8; len];
                let read = file_io::read_at(&file, &mut data, offset)?;
                data.truncate(read);

                let reply = Crr {
                    number: acr.number,
                    error: wire::NO_ERROR,
                    chunk_number,
                    data: data.into(),
                };
                self.socket.send_to(&reply.encode(), peer).await?;

                sleep(delta_t).await;
            }
        }
        Ok(())
    }

    async fn send_ntm(&self, number: u8, peer: SocketAddr) -> Result<(), SanftError> {
        let token = self.minter.lock().await.mint(&peer);
        let ntm = Ntm { number, error: wire::NO_ERROR, token };
        self.socket.send_to(&ntm.encode(), peer).await?;
        Ok(())
    }

    async fn reply_error(
        &self,
        kind: u8,
        number: u8,
        error: u8,
        peer: SocketAddr,
    ) -> Result<(), SanftError> {
        let header = ServerHeader { kind, number, error };
        self.socket.send_to(&header.encode(), peer).await?;
        Ok(())
    }
}

/// Maps a request URI to a path below the root directory.
///
/// Leading slashes are stripped, `..` and `//` are removed outright, and the
/// joined path must still sit under the root, otherwise the URI is refused.
pub(crate) fn resolve_uri(root: &Path, uri: &str) -> Option<PathBuf> {
    let mut cleaned = uri.trim_start_matches('/').replace("..", "");
    while cleaned.contains("//") {
        cleaned = cleaned.replace("//", "/");
    }
    let relative = cleaned.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    let path = root.join(relative);
    path.starts_with(root).then_some(path)
}
