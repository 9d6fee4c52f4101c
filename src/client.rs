//! The SANFT client transfer engine.
//!
//! A transfer is a metadata handshake followed by rounds of aggregated
//! chunk requests. Each round asks for the longest prefix of missing chunks
//! the server allows, collects the paced responses until a deadline, writes
//! them positionally into the sink, and adapts the requested packet rate
//! and the retransmission timeout from what actually arrived. The engine is
//! a single task; the socket read deadline is the only suspension point.

use crate::base::TransferStats;
use crate::config::ClientConfig;
use crate::error::SanftError;
use crate::file_io;
use crate::progress::TransferProgress;
use crate::rate::compute_packet_rate;
use crate::wire::{self, Acr, Cr, Mdr, ServerMessage, WireError};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Floor for the adaptive timeout. Loopback RTTs are far below the server's
/// pacing interval; without a floor a refreshed timeout would close rounds
/// before the first paced CRR can arrive.
const MIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything the client tracks about one transfer in flight.
struct FileMetadata {
    token: wire::Token,
    uri: String,
    file_id: u32,
    chunk_size: u16,
    max_chunks_in_acr: u16,
    /// File size in chunks, not bytes.
    file_size: u64,
    checksum: wire::Checksum,
    /// Chunk indices that have been received and written.
    received: HashSet<u64>,
    /// Smallest chunk index not yet received. Monotone while the fileID
    /// stays the same.
    first_missing: u64,
    timeout: Duration,
    packet_rate: u32,
    counter: u8,
    stats: TransferStats,
}

impl FileMetadata {
    fn new(uri: String, config: &ClientConfig) -> Self {
        Self {
            token: [0u8; wire::TOKEN_LEN],
            uri,
            file_id: 0,
            chunk_size: 0,
            max_chunks_in_acr: 0,
            file_size: 0,
            checksum: [0u8; wire::CHECKSUM_LEN],
            received: HashSet::new(),
            first_missing: 0,
            timeout: Duration::from_secs(config.initial_timeout_secs),
            packet_rate: config.initial_packet_rate.max(1),
            counter: 0,
            stats: TransferStats::new(),
        }
    }

    /// The message counter disambiguates late responses; wrapping is fine.
    fn next_number(&mut self) -> u8 {
        let number = self.counter;
        self.counter = self.counter.wrapping_add(1);
        number
    }
}

/// Fetches `uri` from `server` into `local_path`.
///
/// Runs the complete exchange: metadata handshake (with token acquisition),
/// chunk retrieval with loss recovery and resume across fileID changes, and
/// the final checksum verification. On any fatal error, and on checksum
/// mismatch, the local file is removed.
pub async fn request_file(
    server: SocketAddr,
    uri: &str,
    local_path: &Path,
    config: &ClientConfig,
) -> Result<(), SanftError> {
    let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let mut metadata = FileMetadata::new(uri.to_owned(), config);

    info!(server = %server, uri = %uri, "requesting file");
    update_metadata(&socket, &mut metadata, None, config).await?;

    let sink = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(local_path)?;
    let progress = TransferProgress::new(metadata.file_size, config.progress_bar);
    progress.set_message(uri.to_owned());

    let outcome = fetch_chunks(&socket, &mut metadata, &sink, &progress, config).await;
    progress.finish();
    drop(sink);

    if let Err(e) = outcome {
        let _ = std::fs::remove_file(local_path);
        return Err(e);
    }

    let checksum = file_io::compute_checksum(local_path)?;
    if checksum != metadata.checksum {
        warn!(path = %local_path.display(), "checksum mismatch, removing file");
        let _ = std::fs::remove_file(local_path);
        return Err(SanftError::ChecksumMismatch(local_path.to_path_buf()));
    }

    info!(
        path = %local_path.display(),
        received = metadata.stats.received,
        late = metadata.stats.late,
        invalid = metadata.stats.invalid,
        "transfer complete"
    );
    Ok(())
}

/// Runs the metadata handshake, retransmitting up to the configured budget.
///
/// An NTM consumes one attempt and restarts with the fresh token. On
/// success the timeout is refreshed from the observed RTT, and when the
/// server issued a new fileID (or nothing was received yet) the sink and
/// the received-set are reset for a restart from chunk zero.
async fn update_metadata(
    socket: &UdpSocket,
    metadata: &mut FileMetadata,
    sink: Option<&File>,
    config: &ClientConfig,
) -> Result<(), SanftError> {
    let mut buf = vec![0u8; wire::MAX_DATAGRAM];
    for _ in 0..config.mdr_retransmissions.max(1) {
        let mdr = Mdr {
            number: metadata.next_number(),
            token: metadata.token,
            uri: metadata.uri.clone(),
        };
        socket.send(&mdr.encode()).await?;
        let t_send = Instant::now();
        let deadline = t_send + metadata.timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let received = match timeout(deadline - now, socket.recv(&mut buf)).await {
                Err(_) => break,
                Ok(received) => received?,
            };
            let message = match wire::parse_server(&buf[..received]) {
                Ok(message) => message,
                Err(WireError::UnsupportedVersion { .. }) => {
                    return Err(SanftError::UnsupportedVersion)
                }
                Err(e) => {
                    debug!(error = %e, "ignoring unusable datagram");
                    continue;
                }
            };
            match message {
                ServerMessage::Ntm(ntm) => {
                    debug!("received a token challenge");
                    metadata.token = ntm.token;
                    break;
                }
                ServerMessage::Mdrr(mdrr) if mdrr.number == mdr.number => {
                    let rtt = Instant::now().duration_since(t_send);
                    let id_changed = mdrr.file_id != metadata.file_id;
                    metadata.chunk_size = mdrr.chunk_size;
                    metadata.max_chunks_in_acr = mdrr.max_chunks_in_acr;
                    metadata.file_id = mdrr.file_id;
                    metadata.file_size = mdrr.file_size;
                    metadata.checksum = mdrr.checksum;
                    metadata.timeout = (rtt * config.rtt_to_timeout_factor).max(MIN_TIMEOUT);

                    if id_changed || metadata.received.is_empty() {
                        // Everything fetched so far belongs to a dead fileID.
                        if let Some(file) = sink {
                            file.set_len(0)?;
                        }
                        metadata.received.clear();
                        metadata.first_missing = 0;
                        metadata.stats.reset();
                    }
                    info!(
                        file_id = mdrr.file_id,
                        chunks = mdrr.file_size,
                        chunk_size = mdrr.chunk_size,
                        "metadata updated"
                    );
                    return Ok(());
                }
                ServerMessage::HeaderOnly(header) => match (header.kind, header.error) {
                    (_, wire::UNSUPPORTED_VERSION) => return Err(SanftError::UnsupportedVersion),
                    (wire::MDRR_T, wire::FILE_NOT_FOUND) if header.number == mdr.number => {
                        return Err(SanftError::FileNotFound(metadata.uri.clone()));
                    }
                    _ => {}
                },
                // Mismatched numbers and stray chunk responses: keep waiting.
                _ => {}
            }
        }
    }
    Err(SanftError::NoResponse)
}

/// Requests missing chunks round by round until the file is complete.
async fn fetch_chunks(
    socket: &UdpSocket,
    metadata: &mut FileMetadata,
    sink: &File,
    progress: &TransferProgress,
    config: &ClientConfig,
) -> Result<(), SanftError> {
    let mut buf = vec![0u8; wire::MAX_DATAGRAM];
    while metadata.first_missing < metadata.file_size {
        let (crs, requested) = build_acr(metadata);
        let acr = Acr {
            number: metadata.next_number(),
            token: metadata.token,
            file_id: metadata.file_id,
            packet_rate: metadata.packet_rate,
            crs,
        };
        socket.send(&acr.encode()).await?;
        metadata.stats.requested += requested.len() as u64;
        let t_send = Instant::now();
        let mut deadline = t_send + metadata.timeout;

        // Requested chunk index -> position in request order. Arrival times
        // are recorded per position for the rate measurement.
        let position: HashMap<u64, usize> =
            requested.iter().enumerate().map(|(pos, &index)| (index, pos)).collect();
        let mut arrivals: HashMap<usize, Instant> = HashMap::new();
        // A round cut short by a token challenge or a metadata refresh is
        // not a silent round; it must not feed the backoff or the estimator.
        let mut restarted = false;

        'round: loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let received = match timeout(deadline - now, socket.recv(&mut buf)).await {
                Err(_) => break,
                Ok(received) => received?,
            };
            let message = match wire::parse_server(&buf[..received]) {
                Ok(message) => message,
                Err(WireError::UnsupportedVersion { .. }) => {
                    return Err(SanftError::UnsupportedVersion)
                }
                Err(e) => {
                    debug!(error = %e, "ignoring unusable datagram");
                    metadata.stats.invalid += 1;
                    continue;
                }
            };
            match message {
                ServerMessage::Ntm(ntm) => {
                    if ntm.token != metadata.token {
                        // The server re-keyed, or we moved. Restart the
                        // round under the fresh token.
                        debug!("token challenge mid-transfer");
                        metadata.token = ntm.token;
                        restarted = true;
                        break 'round;
                    }
                }
                ServerMessage::Mdrr(_) => {
                    metadata.stats.invalid += 1;
                }
                ServerMessage::HeaderOnly(header) => match (header.kind, header.error) {
                    (_, wire::UNSUPPORTED_VERSION) => return Err(SanftError::UnsupportedVersion),
                    (wire::CRR_T, wire::INVALID_FILE_ID) => {
                        info!("file ID no longer valid, refreshing metadata");
                        update_metadata(socket, metadata, Some(sink), config).await?;
                        progress.set_position(metadata.received.len() as u64);
                        restarted = true;
                        break 'round;
                    }
                    (wire::CRR_T, wire::TOO_MANY_CHUNKS) => {
                        if requested.len() > usize::from(metadata.max_chunks_in_acr) {
                            return Err(SanftError::ProtocolViolation(
                                "sent an ACR above the server's chunk limit".into(),
                            ));
                        }
                        warn!("server rejected a conforming ACR as too large");
                    }
                    (wire::CRR_T, wire::ZERO_LENGTH_CR) => {
                        if acr.crs.iter().any(|cr| cr.length == 0) {
                            return Err(SanftError::ProtocolViolation(
                                "sent an ACR with a zero-length chunk request".into(),
                            ));
                        }
                        warn!("server reported a zero-length CR we never sent");
                    }
                    _ => {
                        metadata.stats.invalid += 1;
                    }
                },
                ServerMessage::Crr(crr) => {
                    if crr.number != acr.number {
                        metadata.stats.late += 1;
                        continue;
                    }
                    if crr.error == wire::CHUNK_OUT_OF_BOUNDS {
                        if requested.iter().any(|&index| index >= metadata.file_size) {
                            return Err(SanftError::ProtocolViolation(
                                "requested a chunk beyond the end of the file".into(),
                            ));
                        }
                        warn!(chunk = crr.chunk_number, "server claims an in-bounds chunk is out of bounds");
                        continue;
                    }
                    let Some(&pos) = position.get(&crr.chunk_number) else {
                        metadata.stats.invalid += 1;
                        continue;
                    };

                    let now = Instant::now();
                    if arrivals.is_empty() {
                        // First response of the round refreshes the RTT estimate.
                        metadata.timeout = (now.duration_since(t_send)
                            * config.rtt_to_timeout_factor)
                            .max(MIN_TIMEOUT);
                    }
                    arrivals.entry(pos).or_insert(now);

                    // Give the server room to finish streaming the rest.
                    let remaining = requested.len().saturating_sub(arrivals.len());
                    let grace = (u64::from(config.crrs_to_wait) + remaining as u64) as f64
                        / f64::from(metadata.packet_rate.max(1));
                    deadline = now + Duration::from_secs_f64(grace);

                    let duplicate = metadata.received.contains(&crr.chunk_number);
                    match write_chunk_to_file(metadata, crr.chunk_number, &crr.data, sink) {
                        Ok(()) => {
                            if !duplicate {
                                metadata.stats.received += 1;
                            }
                            progress.set_position(metadata.received.len() as u64);
                        }
                        Err(SanftError::BadChunkLength { index, len }) => {
                            debug!(chunk = index, len, "chunk with wrong length");
                            metadata.stats.invalid += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if restarted {
            continue;
        }
        if arrivals.is_empty() {
            // Nothing at all came back: assume congestion, back off.
            metadata.timeout *= 2;
            debug!(timeout = ?metadata.timeout, "empty round, doubling timeout");
        } else if requested.len() > 1 {
            match compute_packet_rate(&arrivals, requested.len(), metadata.packet_rate) {
                Ok(rate) => metadata.packet_rate = rate,
                Err(e) => warn!(error = %e, "keeping previous packet rate"),
            }
        }
    }
    Ok(())
}

/// Builds the CR list covering the longest prefix of missing chunks.
///
/// Contiguous missing runs coalesce into single CRs, capped by the u8
/// length field and by the server's per-ACR chunk budget. Returns the CRs
/// together with the requested chunk indices in request order.
fn build_acr(metadata: &FileMetadata) -> (Vec<Cr>, Vec<u64>) {
    let mut crs = Vec::new();
    let mut requested = Vec::new();
    let max_chunks = u32::from(metadata.max_chunks_in_acr);
    let mut total: u32 = 0;
    let mut index = metadata.first_missing;

    while total < max_chunks && index < metadata.file_size {
        if metadata.received.contains(&index) {
            index += 1;
            continue;
        }
        let offset = index;
        let mut run: u32 = 0;
        while index < metadata.file_size
            && run < u32::from(u8::MAX)
            && total + run < max_chunks
            && !metadata.received.contains(&index)
        {
            requested.push(index);
            run += 1;
            index += 1;
        }
        crs.push(Cr { offset, length: run as u8 });
        total += run;
    }
    (crs, requested)
}

/// Writes one chunk at its position in the sink.
///
/// Duplicates are a silent no-op. Every chunk except the last must be
/// exactly `chunk_size` long; the last one may be shorter but not empty.
fn write_chunk_to_file(
    metadata: &mut FileMetadata,
    index: u64,
    data: &[u8],
    sink: &File,
) -> Result<(), SanftError> {
    if metadata.received.contains(&index) {
        return Ok(());
    }
    let last = metadata.file_size.saturating_sub(1);
    let expected = metadata.chunk_size as usize;
    if data.is_empty() || data.len() > expected || (index != last && data.len() != expected) {
        return Err(SanftError::BadChunkLength { index, len: data.len() });
    }

    file_io::write_all_at(sink, data, index * u64::from(metadata.chunk_size))?;
    metadata.received.insert(index);
    while metadata.received.contains(&metadata.first_missing) {
        metadata.first_missing += 1;
    }
    Ok(())
}
