//! Address-bound session tokens.
//!
//! A token is proof of reachability at the claimed address: the server
//! derives it from the peer's IP, the peer's port and a rotating secret, and
//! the client echoes it opaquely. A client that moves to a new source port
//! stops matching and is re-challenged with an NTM.

use crate::wire::Token;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub const SECRET_LEN: usize = 256;
/// How long one secret stays valid before the lazy rotation replaces it.
pub const SECRET_VALIDITY: Duration = Duration::from_secs(12 * 60 * 60);

/// Mints and verifies per-address tokens under a rotating secret.
pub struct TokenMinter {
    secret: [u8; SECRET_LEN],
    valid_until: Instant,
}

impl TokenMinter {
    pub fn new() -> Self {
        Self {
            secret: fresh_secret(),
            valid_until: Instant::now() + SECRET_VALIDITY,
        }
    }

    /// Rotates the secret if it has expired. Called lazily on each inbound
    /// message; tokens minted under the old secret silently stop checking,
    /// which forces clients through the NTM handshake again.
    pub fn refresh(&mut self) {
        if Instant::now() >= self.valid_until {
            self.secret = fresh_secret();
            self.valid_until = Instant::now() + SECRET_VALIDITY;
        }
    }

    /// Derives the token for `addr` under the current secret.
    pub fn mint(&self, addr: &SocketAddr) -> Token {
        let mut hasher = Sha256::new();
        match addr.ip() {
            IpAddr::V4(ip) => hasher.update(ip.octets()),
            IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(addr.port().to_le_bytes());
        hasher.update(self.secret);
        hasher.finalize().into()
    }

    /// True iff `token` is the current token for `addr`.
    pub fn check(&self, addr: &SocketAddr, token: &Token) -> bool {
        self.mint(addr) == *token
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}

fn fresh_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
