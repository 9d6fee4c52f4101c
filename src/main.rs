use clap::Parser;
use sanft::config::Config;
use sanft::{request_file, SanftError, Server};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "sanft")]
#[command(about = "Simple Authenticated Network File Transfer over UDP")]
struct Cli {
    /// Server mode: accept incoming requests from any host. Without -s the
    /// tool runs in client mode.
    #[arg(short = 's', long)]
    server: bool,

    /// Port number to listen on or connect to (default 1337)
    #[arg(short = 't', long)]
    port: Option<u16>,

    /// Directory containing the files the server serves (default ./)
    #[arg(short = 'd', long = "file-dir")]
    file_dir: Option<PathBuf>,

    /// Chunk size advertised and used by the server (default 4048)
    #[arg(long)]
    chunk_size: Option<u16>,

    /// Maximum number of chunks allowed in one ACR (default 128)
    #[arg(long)]
    max_chunks_in_acr: Option<u16>,

    /// Loss probability for entering the dropping state (testing only)
    #[arg(long)]
    p: Option<f64>,

    /// Loss probability for staying in the dropping state (testing only)
    #[arg(long)]
    q: Option<f64>,

    /// Optional TOML configuration file; command-line flags win over it
    #[arg(long)]
    config: Option<PathBuf>,

    /// The host to request from (hostname or IP address)
    host: Option<String>,

    /// The URI(s) of the file(s) to fetch (client mode)
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), SanftError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_or_create(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.file_dir {
        config.server.root_dir = dir;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.server.chunk_size = chunk_size;
    }
    if let Some(max_chunks) = cli.max_chunks_in_acr {
        config.server.max_chunks_in_acr = max_chunks;
    }
    if let Some(p) = cli.p {
        config.server.loss_p = p;
    }
    if let Some(q) = cli.q {
        config.server.loss_q = q;
    }

    if cli.server {
        let server = Server::bind(config.server).await?;
        // The sender is never flipped here; the accept loop runs until the
        // process is killed. Tests drive the same channel to stop cleanly.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        server.run(shutdown_rx).await
    } else {
        let Some(host) = cli.host else {
            return Err(SanftError::Config(
                "client mode needs a server host; use --server to serve".into(),
            ));
        };
        if cli.files.is_empty() {
            return Err(SanftError::Config(
                "client mode needs at least one file URI to fetch".into(),
            ));
        }

        let server_addr = resolve_host(&host, config.server.port).await?;
        for uri in &cli.files {
            let local_path = local_name(uri)?;
            info!(uri = %uri, to = %local_path.display(), "fetching");
            request_file(server_addr, uri, &local_path, &config.client).await?;
        }
        Ok(())
    }
}

async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, SanftError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| SanftError::Config(format!("could not resolve host {host}")))
}

/// The local file name for a fetched URI: its last path segment.
fn local_name(uri: &str) -> Result<PathBuf, SanftError> {
    Path::new(uri)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| SanftError::Config(format!("URI {uri} has no file name")))
}
