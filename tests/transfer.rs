//! End-to-end transfers over loopback UDP.
//!
//! The happy paths run against the real server; the mid-transfer twists
//! (fileID reissue, file deletion, token churn) run against a scriptable
//! mock server, because the real one cannot be told to misbehave on cue.

use sanft::config::{ClientConfig, ServerConfig};
use sanft::error::SanftError;
use sanft::wire::{self, Acr, ClientMessage, Crr, Mdr, Mdrr, Ntm, ServerHeader, Token};
use sanft::{request_file, Server};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

fn test_client_config() -> ClientConfig {
    ClientConfig {
        initial_timeout_secs: 1,
        initial_packet_rate: 64,
        progress_bar: false,
        ..ClientConfig::default()
    }
}

fn random_data(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

async fn start_server(
    root: &Path,
    chunk_size: u16,
    max_chunks_in_acr: u16,
    loss_p: f64,
    loss_q: f64,
) -> (SocketAddr, watch::Sender<bool>) {
    let config = ServerConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        root_dir: root.to_path_buf(),
        chunk_size,
        max_chunks_in_acr,
        loss_p,
        loss_q,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.expect("bind server");
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { server.run(shutdown_rx).await.expect("server run") });
    (addr, shutdown_tx)
}

async fn fetch_and_compare(
    addr: SocketAddr,
    uri: &str,
    data: &[u8],
) -> Result<(), SanftError> {
    let download_dir = tempfile::tempdir().unwrap();
    let local = download_dir.path().join("download.bin");
    request_file(addr, uri, &local, &test_client_config()).await?;
    assert_eq!(std::fs::read(&local).unwrap(), data, "downloaded bytes differ");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_small_file_in_a_single_acr() {
    let root = tempfile::tempdir().unwrap();
    let data = random_data(20);
    std::fs::write(root.path().join("small.bin"), &data).unwrap();

    let (addr, _shutdown) = start_server(root.path(), 64, 10, 0.0, 0.0).await;
    fetch_and_compare(addr, "small.bin", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_size_is_exact_multiple_of_chunk_size() {
    let root = tempfile::tempdir().unwrap();
    let data = random_data(256);
    std::fs::write(root.path().join("exact.bin"), &data).unwrap();

    // 8 chunks with a budget of 4: exactly two ACRs.
    let (addr, _shutdown) = start_server(root.path(), 32, 4, 0.0, 0.0).await;
    fetch_and_compare(addr, "exact.bin", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_chunk_per_acr() {
    let root = tempfile::tempdir().unwrap();
    let data = random_data(223);
    std::fs::write(root.path().join("drip.bin"), &data).unwrap();

    let (addr, _shutdown) = start_server(root.path(), 64, 1, 0.0, 0.0).await;
    fetch_and_compare(addr, "drip.bin", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_larger_file_across_many_rounds() {
    let root = tempfile::tempdir().unwrap();
    let data = random_data(100_000);
    std::fs::write(root.path().join("large.bin"), &data).unwrap();

    let (addr, _shutdown) = start_server(root.path(), 512, 32, 0.0, 0.0).await;
    fetch_and_compare(addr, "large.bin", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uri_in_subdirectory() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("sub/dir")).unwrap();
    let data = random_data(500);
    std::fs::write(root.path().join("sub/dir/nested.bin"), &data).unwrap();

    let (addr, _shutdown) = start_server(root.path(), 64, 8, 0.0, 0.0).await;
    fetch_and_compare(addr, "/sub/dir/nested.bin", &data).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let (addr, _shutdown) = start_server(root.path(), 64, 10, 0.0, 0.0).await;

    let download_dir = tempfile::tempdir().unwrap();
    let local = download_dir.path().join("missing.bin");
    let err = request_file(addr, "does-not-exist.bin", &local, &test_client_config())
        .await
        .unwrap_err();
    assert!(matches!(err, SanftError::FileNotFound(_)), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transfer_survives_packet_loss() {
    let root = tempfile::tempdir().unwrap();
    let data = random_data(30 * 16);
    std::fs::write(root.path().join("lossy.bin"), &data).unwrap();

    // Every fourth datagram or so vanishes; retransmission rounds must fill
    // the holes and the checksum still has to match.
    let (addr, _shutdown) = start_server(root.path(), 16, 8, 0.25, 0.25).await;
    fetch_and_compare(addr, "lossy.bin", &data).await.unwrap();
}

// ---------------------------------------------------------------------------
// Scriptable mock server for mid-transfer misbehavior.
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MockFile {
    file_id: u32,
    data: Vec<u8>,
}

struct MockState {
    token: Token,
    uri: String,
    chunk_size: u16,
    max_chunks_in_acr: u16,
    file: Option<MockFile>,
    served_chunks: usize,
    /// After this many served chunks, switch to a different file and ID.
    swap_after: Option<(usize, MockFile)>,
    /// After this many served chunks, the file "disappears".
    delete_after: Option<usize>,
    /// After this many served chunks, invalidate the client's token.
    rekey_after: Option<usize>,
}

impl MockState {
    fn fire_triggers(&mut self) {
        if let Some((at, replacement)) = &self.swap_after {
            if self.served_chunks >= *at {
                self.file = Some(replacement.clone());
                self.swap_after = None;
            }
        }
        if let Some(at) = self.delete_after {
            if self.served_chunks >= at {
                self.file = None;
                self.delete_after = None;
            }
        }
        if let Some(at) = self.rekey_after {
            if self.served_chunks >= at {
                self.token[0] ^= 0xff;
                self.rekey_after = None;
            }
        }
    }
}

async fn start_mock(state: MockState) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let state = Arc::new(Mutex::new(state));
    tokio::spawn(run_mock(socket, state));
    addr
}

async fn run_mock(socket: UdpSocket, state: Arc<Mutex<MockState>>) {
    let mut buf = vec![0u8; wire::MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => return,
        };
        let message = match wire::parse_client(&buf[..len]) {
            Ok(message) => message,
            Err(_) => continue,
        };
        let mut state = state.lock().await;
        match message {
            ClientMessage::Mdr(mdr) => mock_mdr(&socket, &mut state, mdr, peer).await,
            ClientMessage::Acr(acr) => mock_acr(&socket, &mut state, acr, peer).await,
        }
    }
}

async fn mock_mdr(socket: &UdpSocket, state: &mut MockState, mdr: Mdr, peer: SocketAddr) {
    if mdr.token != state.token {
        let ntm = Ntm { number: mdr.number, error: wire::NO_ERROR, token: state.token };
        let _ = socket.send_to(&ntm.encode(), peer).await;
        return;
    }
    let served = if mdr.uri == state.uri { state.file.as_ref() } else { None };
    let Some(file) = served else {
        let header =
            ServerHeader { kind: wire::MDRR_T, number: mdr.number, error: wire::FILE_NOT_FOUND };
        let _ = socket.send_to(&header.encode(), peer).await;
        return;
    };
    let mdrr = Mdrr {
        number: mdr.number,
        chunk_size: state.chunk_size,
        max_chunks_in_acr: state.max_chunks_in_acr,
        file_id: file.file_id,
        file_size: (file.data.len() as u64).div_ceil(u64::from(state.chunk_size)),
        checksum: Sha256::digest(&file.data).into(),
    };
    let _ = socket.send_to(&mdrr.encode(), peer).await;
}

async fn mock_acr(socket: &UdpSocket, state: &mut MockState, acr: Acr, peer: SocketAddr) {
    if acr.token != state.token {
        let ntm = Ntm { number: acr.number, error: wire::NO_ERROR, token: state.token };
        let _ = socket.send_to(&ntm.encode(), peer).await;
        return;
    }
    let valid = state.file.as_ref().is_some_and(|file| file.file_id == acr.file_id);
    if !valid {
        let header =
            ServerHeader { kind: wire::CRR_T, number: acr.number, error: wire::INVALID_FILE_ID };
        let _ = socket.send_to(&header.encode(), peer).await;
        return;
    }

    let chunk_size = u64::from(state.chunk_size);
    let (data, file_size) = {
        let file = state.file.as_ref().unwrap();
        (file.data.clone(), (file.data.len() as u64).div_ceil(chunk_size))
    };
    'crs: for cr in &acr.crs {
        for step in 0..u64::from(cr.length) {
            let chunk_number = cr.offset + step;
            if chunk_number >= file_size {
                let crr = Crr {
                    number: acr.number,
                    error: wire::CHUNK_OUT_OF_BOUNDS,
                    chunk_number,
                    data: bytes::Bytes::new(),
                };
                let _ = socket.send_to(&crr.encode(), peer).await;
                continue 'crs;
            }
            let start = (chunk_number * chunk_size) as usize;
            let end = data.len().min(start + chunk_size as usize);
            let crr = Crr {
                number: acr.number,
                error: wire::NO_ERROR,
                chunk_number,
                data: bytes::Bytes::copy_from_slice(&data[start..end]),
            };
            let _ = socket.send_to(&crr.encode(), peer).await;
            state.served_chunks += 1;
            state.fire_triggers();
            // The trigger may have invalidated what we are streaming.
            if state.file.as_ref().map(|file| file.file_id) != Some(acr.file_id) {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

fn base_mock(uri: &str, data: Vec<u8>, file_id: u32) -> MockState {
    MockState {
        token: [0x5a; 32],
        uri: uri.to_string(),
        chunk_size: 8,
        max_chunks_in_acr: 4,
        file: Some(MockFile { file_id, data }),
        served_chunks: 0,
        swap_after: None,
        delete_after: None,
        rekey_after: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_id_change_mid_transfer_restarts_from_scratch() {
    let data_a = random_data(37);
    let data_b = random_data(53);
    let mut state = base_mock("swap.bin", data_a, 0x00fa_cade);
    state.swap_after = Some((1, MockFile { file_id: 0x1337_c001, data: data_b.clone() }));
    let addr = start_mock(state).await;

    let download_dir = tempfile::tempdir().unwrap();
    let local = download_dir.path().join("swap.bin");
    request_file(addr, "swap.bin", &local, &test_client_config()).await.unwrap();

    // The sink was truncated on the fileID change; only the new content
    // survives.
    assert_eq!(std::fs::read(&local).unwrap(), data_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_deletion_mid_transfer_fails_with_not_found() {
    let data = random_data(37);
    let mut state = base_mock("vanish.bin", data, 0xc0de_600d);
    state.delete_after = Some(1);
    let addr = start_mock(state).await;

    let download_dir = tempfile::tempdir().unwrap();
    let local = download_dir.path().join("vanish.bin");
    let err = request_file(addr, "vanish.bin", &local, &test_client_config())
        .await
        .unwrap_err();

    assert!(matches!(err, SanftError::FileNotFound(_)), "got {err:?}");
    // Mid-transfer fatals leave no partial file behind.
    assert!(!local.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_token_churn_mid_transfer_is_recovered() {
    let data = random_data(61);
    let mut state = base_mock("rekey.bin", data.clone(), 0x0b16_f11e);
    state.rekey_after = Some(1);
    let addr = start_mock(state).await;

    let download_dir = tempfile::tempdir().unwrap();
    let local = download_dir.path().join("rekey.bin");
    request_file(addr, "rekey.bin", &local, &test_client_config()).await.unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), data);
}
