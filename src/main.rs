//! `torrentd`: a minimal single-file BitTorrent peer client, tracker, and
//! torrent-creation tool in one binary.
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustorrent_node::config::Config;
use rustorrent_node::engine::{create_torrent, Engine};
use rustorrent_node::tracker::server::TrackerState;
use tracing_subscriber::EnvFilter;

/// A minimal BitTorrent peer client, tracker, and torrent-creation tool.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download (and seed) a torrent from its metainfo file.
    Peer {
        /// Path to the `.torrent` file.
        torrent_file: PathBuf,

        /// Directory the downloaded file is written into.
        #[arg(short, long, default_value = ".")]
        download_dir: PathBuf,

        /// Listen port to announce to the tracker and accept peers on.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a standalone HTTP tracker.
    Tracker {
        /// Port to listen on.
        port: u16,
    },
    /// Create a `.torrent` file from a regular file.
    CreateTorrent {
        /// The file to hash and package.
        file: PathBuf,

        /// The announce URL to embed.
        tracker_url: String,

        /// Where to write the resulting `.torrent` file.
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Peer {
            torrent_file,
            download_dir,
            port,
        } => run_peer(torrent_file, download_dir, port).await,
        Command::Tracker { port } => run_tracker(port).await,
        Command::CreateTorrent {
            file,
            tracker_url,
            output,
        } => run_create_torrent(file, tracker_url, output),
    }
}

async fn run_peer(torrent_file: PathBuf, download_dir: PathBuf, port: Option<u16>) -> Result<()> {
    let metainfo_bytes = std::fs::read(&torrent_file)?;
    let config = match port {
        Some(port) => Config::new(port)?,
        None => Config::with_random_port()?,
    };
    tracing::info!(listen_port = config.listen_port, "starting peer");

    let engine = Engine::new(&metainfo_bytes, &download_dir, config)?;
    engine.run().await
}

async fn run_tracker(port: u16) -> Result<()> {
    let state = TrackerState::new();
    state.spawn_reaper();

    let app = rustorrent_node::tracker::server::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "starting tracker");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn run_create_torrent(file: PathBuf, tracker_url: String, output: PathBuf) -> Result<()> {
    let file_bytes = std::fs::read(&file)?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("file path has no valid file name"))?;

    let torrent_bytes = create_torrent(&file_bytes, file_name, &tracker_url)?;
    std::fs::write(&output, &torrent_bytes)?;

    tracing::info!(output = %output.display(), "torrent created");
    println!("Torrent created: {}", output.display());
    Ok(())
}
