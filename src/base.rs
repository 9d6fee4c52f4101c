//! Shared functionality for client and server.
//!
//! Chunk arithmetic used on both sides of the protocol, and the counters a
//! transfer keeps about itself.

/// Number of chunks needed to cover `file_bytes` bytes.
///
/// The last chunk may be shorter than `chunk_size`; an empty file still
/// occupies zero chunks.
pub fn chunk_count(file_bytes: u64, chunk_size: u16) -> u64 {
    debug_assert!(chunk_size > 0);
    file_bytes.div_ceil(chunk_size as u64)
}

/// Byte offset and length of chunk `index` within a file of `file_bytes`
/// bytes.
pub fn chunk_span(index: u64, file_bytes: u64, chunk_size: u16) -> (u64, usize) {
    let offset = index * chunk_size as u64;
    let len = (file_bytes.saturating_sub(offset)).min(chunk_size as u64);
    (offset, len as usize)
}

/// Datagram counters tracked per transfer.
///
/// `invalid` counts datagrams that parsed badly or answered something never
/// asked for; `late` counts responses to an earlier request number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks requested across all ACRs.
    pub requested: u64,
    /// Chunks received and written.
    pub received: u64,
    /// Datagrams dropped as unusable.
    pub invalid: u64,
    /// Responses that arrived for a previous request number.
    pub late: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, e.g. after the server re-issued the fileID.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
