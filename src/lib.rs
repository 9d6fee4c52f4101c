//! sanft - Simple Authenticated Network File Transfer.
//!
//! A request-response file transfer protocol over UDP. A client retrieves a
//! named file from a server; the protocol provides file discovery by URI,
//! session binding via server-issued tokens, chunk-level selective
//! retrieval, client-driven pacing, and integrity verification by SHA-256.
//!
//! # Example
//!
//! ```no_run
//! use sanft::{config::ClientConfig, request_file};
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), sanft::SanftError> {
//! let server = "192.0.2.1:1337".parse().unwrap();
//! request_file(server, "data/big.iso", Path::new("big.iso"), &ClientConfig::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod client;
pub mod config;
pub mod error;
pub mod file_io;
pub mod markov;
pub mod progress;
pub mod rate;
pub mod registry;
pub mod server;
pub mod token;
pub mod wire;

pub use client::request_file;
pub use config::Config;
pub use error::SanftError;
pub use server::Server;
