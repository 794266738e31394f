//! `rstc` — a thin CLI front end for the leecher-mode download core.
//!
//! Deliberately minimal: parse a torrent path and an output directory,
//! start a download, print progress, and exit once it's done. Everything
//! interesting lives in the library crate.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rs_torrent_client::config::Config;
use rs_torrent_client::download::Download;

#[derive(Parser, Debug)]
#[command(name = "rstc", about = "A leecher-mode BitTorrent client")]
struct Cli {
    /// Path to the .torrent metainfo file.
    torrent_path: PathBuf,

    /// Directory to write the downloaded files into.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Local TCP port advertised to trackers.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rs_torrent_client=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = Config::default();
    config.listening_port = cli.port;

    let download = Download::start(&cli.torrent_path, &cli.output_dir, config).await?;

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let progress = download.progress().await;
        tracing::info!(
            pieces_complete = progress.pieces_complete,
            total_pieces = progress.total_pieces,
            bytes_downloaded = progress.bytes_downloaded,
            connected_peers = progress.connected_peers,
            "progress"
        );
        if progress.total_pieces > 0 && progress.pieces_complete == progress.total_pieces {
            break;
        }
        if download.is_done() {
            break;
        }
    }

    download.stop().await;
    Ok(())
}
