//! Positional file I/O and whole-file checksums.
//!
//! Chunks live at `index * chunk_size` and are read and written in place,
//! so out-of-order arrival never needs reassembly buffers. On Unix the
//! positional calls go through `pread`/`pwrite`; elsewhere they fall back
//! to seek-then-access.

use crate::error::SanftError;
use crate::wire::Checksum;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// SHA-256 over the entire file at `path`.
pub fn compute_checksum(path: &Path) -> Result<Checksum, SanftError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Reads up to `buf.len()` bytes at `offset` without moving any cursor.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }
}

/// Writes all of `buf` at `offset` without moving any cursor.
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}
