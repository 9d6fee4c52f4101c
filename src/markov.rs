//! Synthetic packet loss for testing.
//!
//! Wraps the server's UDP socket and drops outbound datagrams following a
//! two-state Gilbert model: from the good state a send is dropped with
//! probability `p`, and once dropping has started each further send is
//! dropped with probability `q`. With both probabilities at zero the
//! wrapper is a transparent passthrough.

use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::UdpSocket;

pub struct MarkovSocket {
    socket: UdpSocket,
    p: f64,
    q: f64,
    last_dropped: Mutex<bool>,
}

impl MarkovSocket {
    pub fn new(socket: UdpSocket, p: f64, q: f64) -> Self {
        Self { socket, p, q, last_dropped: Mutex::new(false) }
    }

    /// Sends `buf` to `addr`, unless the loss model eats it. A dropped
    /// datagram still reports full length, exactly like a network would.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.roll_drop() {
            return Ok(buf.len());
        }
        self.socket.send_to(buf, addr).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn roll_drop(&self) -> bool {
        if self.p == 0.0 && self.q == 0.0 {
            return false;
        }
        let mut last_dropped = self.last_dropped.lock().unwrap();
        let threshold = if *last_dropped { self.q } else { self.p };
        *last_dropped = rand::thread_rng().gen::<f64>() < threshold;
        *last_dropped
    }
}
