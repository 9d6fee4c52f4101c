//! Configuration management for sanft.
//!
//! Both roles of the binary are configured here: the server's serving
//! parameters and the client's retransmission and pacing knobs.
//! Configuration is stored in TOML format; every field has a default so a
//! bare invocation works without a config file.

use crate::error::SanftError;
use crate::wire::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// Protocol defaults.
pub const DEFAULT_PORT: u16 = 1337;
pub const DEFAULT_CHUNK_SIZE: u16 = 4048;
pub const DEFAULT_MAX_CHUNKS_IN_ACR: u16 = 128;

// Pacing constants.
// The server sends faster than the client asked by this additive margin so
// the client's rate measurement has headroom to grow.
pub const DEFAULT_RATE_INCREASE: u32 = 256;
pub const DEFAULT_INITIAL_PACKET_RATE: u32 = 64;

// Retransmission constants.
pub const DEFAULT_INITIAL_TIMEOUT_SECS: u64 = 3;
pub const DEFAULT_RTT_TO_TIMEOUT_FACTOR: u32 = 2;
pub const DEFAULT_MDR_RETRANSMISSIONS: u32 = 5;
// Grace period at the end of an ACR round, in expected packet intervals.
pub const DEFAULT_CRRS_TO_WAIT: u32 = 3;

/// Main configuration containing both role configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server-specific configuration.
    pub server: ServerConfig,
    /// Client-specific configuration.
    pub client: ClientConfig,
}

/// Configuration for the serving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Directory the served URIs are resolved against.
    pub root_dir: PathBuf,
    pub chunk_size: u16,
    pub max_chunks_in_acr: u16,
    /// Additive margin on top of the client's requested packet rate.
    pub rate_increase: u32,
    /// Probability of entering the packet-dropping state (testing only).
    pub loss_p: f64,
    /// Probability of staying in the packet-dropping state (testing only).
    pub loss_q: f64,
}

/// Configuration for the requesting side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub initial_packet_rate: u32,
    pub initial_timeout_secs: u64,
    /// Timeout is refreshed to measured RTT times this factor.
    pub rtt_to_timeout_factor: u32,
    pub mdr_retransmissions: u32,
    /// Extra packet intervals granted before an ACR round is closed.
    pub crrs_to_wait: u32,
    pub progress_bar: bool,
}

impl Config {
    /// Loads configuration from a file, or creates a new default
    /// configuration file if none exists at `path`.
    pub fn load_or_create(path: &Path) -> Result<Self, SanftError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path` in TOML format.
    pub fn save(&self, path: &Path) -> Result<(), SanftError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl ServerConfig {
    /// Rejects parameter combinations the protocol cannot serve.
    pub fn validate(&self) -> Result<(), SanftError> {
        if !self.root_dir.is_dir() {
            return Err(SanftError::Config(format!(
                "root directory {} does not exist",
                self.root_dir.display()
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(SanftError::Config(format!(
                "chunk size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if self.max_chunks_in_acr == 0 {
            return Err(SanftError::Config("max chunks in ACR cannot be 0".into()));
        }
        for (name, value) in [("loss_p", self.loss_p), ("loss_q", self.loss_q)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SanftError::Config(format!(
                    "{name} must be a probability in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            root_dir: PathBuf::from("./"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks_in_acr: DEFAULT_MAX_CHUNKS_IN_ACR,
            rate_increase: DEFAULT_RATE_INCREASE,
            loss_p: 0.0,
            loss_q: 0.0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_packet_rate: DEFAULT_INITIAL_PACKET_RATE,
            initial_timeout_secs: DEFAULT_INITIAL_TIMEOUT_SECS,
            rtt_to_timeout_factor: DEFAULT_RTT_TO_TIMEOUT_FACTOR,
            mdr_retransmissions: DEFAULT_MDR_RETRANSMISSIONS,
            crrs_to_wait: DEFAULT_CRRS_TO_WAIT,
            progress_bar: true,
        }
    }
}
