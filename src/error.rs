//! Error types for the SANFT transfer system.
//!
//! Parse failures and transient I/O problems are recovered close to the
//! socket; everything in this enum is either fatal to a transfer or fatal
//! to process startup and travels up to the caller.

use crate::wire::WireError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while serving or fetching files.
#[derive(Debug, Error)]
pub enum SanftError {
    /// An I/O error occurred during file or socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize configuration to TOML format.
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Failed to deserialize configuration from TOML format.
    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// A configuration value is out of range or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A datagram could not be decoded.
    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),

    /// The server does not serve the requested URI.
    #[error("file not found on server: {0}")]
    FileNotFound(String),

    /// The peer speaks a protocol version this implementation does not.
    #[error("peer requires an unsupported protocol version")]
    UnsupportedVersion,

    /// The server never answered within the retransmission budget.
    #[error("no response from server")]
    NoResponse,

    /// The completed file hashes to something other than the advertised
    /// checksum. The local copy has been removed.
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(PathBuf),

    /// The peer confirmed a request we verifiably never made, which means
    /// one of the two endpoints has a bug.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A received chunk does not have the advertised chunk size.
    #[error("chunk {index} has invalid length {len}")]
    BadChunkLength { index: u64, len: usize },

    /// The fileID space could not yield a free identifier for this file.
    #[error("could not assign a file ID for {0}")]
    FileIdExhausted(PathBuf),

    /// The rate estimator was invoked without any usable arrivals.
    #[error("rate estimation failed: {0}")]
    RateEstimation(&'static str),
}
