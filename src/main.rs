//! Command-line front door.
use anyhow::Context;
use clap::Parser;
use leech::config::Config;
use leech::runtime::TorrentRuntime;
use leech::torrent::TorrentFile;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

/// A BitTorrent leecher: downloads a single torrent's pieces and exits.
#[derive(Debug, Parser)]
#[command(name = "leech", version, about)]
struct Args {
    /// Path to a `.torrent` file. Reads from stdin if omitted.
    torrent_path: Option<PathBuf>,

    /// Directory completed files are written under.
    #[arg(long)]
    download_root: Option<PathBuf>,

    /// Maximum number of simultaneous peer connections.
    #[arg(long)]
    max_peers: Option<usize>,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use shorter timeouts suited to local/manual testing.
    #[arg(long)]
    dev: bool,
}

const EXIT_OK: u8 = 0;
const EXIT_MALFORMED_INPUT: u8 = 1;
const EXIT_TRACKER_FAILURE: u8 = 2;
const EXIT_ALL_PEERS_FAILED: u8 = 3;
const EXIT_RETRIES_EXCEEDED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match Config::load(args.config.as_deref(), args.dev) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_MALFORMED_INPUT);
        }
    };
    if let Some(download_root) = args.download_root {
        config.download_root = download_root;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }

    let bytes = match read_torrent_bytes(args.torrent_path.as_deref()) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("failed to read torrent file: {e}");
            return ExitCode::from(EXIT_MALFORMED_INPUT);
        }
    };
    let torrent = match TorrentFile::parse(&bytes) {
        Ok(torrent) => torrent,
        Err(e) => {
            eprintln!("failed to parse torrent file: {e}");
            return ExitCode::from(EXIT_MALFORMED_INPUT);
        }
    };

    tracing::info!(name = %torrent.info.name, pieces = torrent.num_pieces(), "starting download");

    let runtime = TorrentRuntime::new(torrent, config);
    match runtime.run().await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(leech::runtime::RuntimeError::Tracker(e)) => {
            eprintln!("tracker error: {e}");
            ExitCode::from(EXIT_TRACKER_FAILURE)
        }
        Err(e @ (leech::runtime::RuntimeError::NoPeers | leech::runtime::RuntimeError::AllPeersExhausted)) => {
            eprintln!("download failed: {e}");
            ExitCode::from(EXIT_ALL_PEERS_FAILED)
        }
        Err(leech::runtime::RuntimeError::RetriesExceeded) => {
            eprintln!("download failed: one or more pieces exceeded their retry budget");
            ExitCode::from(EXIT_RETRIES_EXCEEDED)
        }
        Err(e) => {
            eprintln!("download failed: {e}");
            ExitCode::from(EXIT_ALL_PEERS_FAILED)
        }
    }
}

fn read_torrent_bytes(path: Option<&std::path::Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading torrent bytes from stdin")?;
            Ok(buf)
        }
    }
}
