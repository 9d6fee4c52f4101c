//! The fileID registry.
//!
//! Every served file gets a 32-bit identifier derived from its path, its
//! modification time and a try counter. The identifier is scoped to this
//! process: deleting the file, touching it, or resetting the registry
//! invalidates it, and the client is expected to re-run the metadata
//! handshake when told so.

use crate::error::SanftError;
use crate::file_io;
use crate::wire::Checksum;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts per assignment before giving up.
const MAX_TRIES: u32 = 10;
/// Reaching this try count wipes the registry: the space is assumed to be
/// clogged with stale entries, and the bounded window must make progress.
const RESET_AT_TRY: u32 = 8;

/// What the server remembers about one served file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub mtime: SystemTime,
    pub try_count: u32,
    /// Cached so an unchanged file is not hashed again on the next MDR.
    pub checksum: Checksum,
}

/// In-memory map from fileID to the file it identifies.
#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: HashMap<u32, FileEntry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_id: u32) -> Option<&FileEntry> {
        self.entries.get(&file_id)
    }

    /// Drops a fileID whose backing file is gone or was modified.
    pub fn remove(&mut self, file_id: u32) {
        self.entries.remove(&file_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds or creates the fileID for `(path, mtime)`.
    ///
    /// Collisions bump the try counter; at try 8 the whole registry is
    /// cleared and the remaining attempts run against the empty map. The
    /// checksum is computed once per new entry and cached.
    pub fn assign(
        &mut self,
        path: &Path,
        mtime: SystemTime,
    ) -> Result<(u32, Checksum), SanftError> {
        for try_count in 0..MAX_TRIES {
            if try_count == RESET_AT_TRY {
                self.entries.clear();
                continue;
            }
            let file_id = derive_file_id(path, mtime, try_count);
            match self.entries.get(&file_id) {
                Some(entry) if entry.path == path && entry.mtime == mtime => {
                    return Ok((file_id, entry.checksum));
                }
                Some(_) => continue,
                None => {
                    let checksum = file_io::compute_checksum(path)?;
                    self.entries.insert(
                        file_id,
                        FileEntry { path: path.to_path_buf(), mtime, try_count, checksum },
                    );
                    return Ok((file_id, checksum));
                }
            }
        }
        Err(SanftError::FileIdExhausted(path.to_path_buf()))
    }
}

/// fileID = lower 32 bits of SHA-256(path || mtime || try).
pub fn derive_file_id(path: &Path, mtime: SystemTime, try_count: u32) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let since_epoch = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
    hasher.update(
        format!("{}.{:09}", since_epoch.as_secs(), since_epoch.subsec_nanos()).as_bytes(),
    );
    hasher.update((try_count as u64).to_le_bytes());
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
