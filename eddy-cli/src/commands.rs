//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use eddy_core::EddyConfig;
use eddy_core::torrent::{
    BencodeParser, SessionState, SwarmTransport, TorrentSource, spawn_engine,
};
use eddy_search::{HttpSearchProvider, TorrentSearch};
use tokio::fs;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the streaming server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Where torrent data is stored
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Download a torrent without serving it
    Download {
        /// Magnet link or path to a .torrent file
        source: String,
        /// Where torrent data is stored
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Print the contents of a .torrent file
    Info {
        /// Path to the torrent file
        torrent: PathBuf,
    },
    /// Search the configured indexer
    Search {
        query: String,
        /// Indexer category filter
        #[arg(long)]
        category: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the chosen command.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { bind, download_dir } => serve(bind, download_dir).await,
        Commands::Download {
            source,
            download_dir,
        } => download(source, download_dir).await,
        Commands::Info { torrent } => info(torrent).await,
        Commands::Search { query, category } => search(query, category).await,
    }
}

fn config(download_dir: Option<PathBuf>) -> EddyConfig {
    let config = EddyConfig::from_env();
    match download_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    }
}

/// Runs the HTTP server until Ctrl-C.
///
/// # Errors
/// - Server could not bind or an HTTP client could not be built
pub async fn serve(bind: Option<SocketAddr>, download_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = config(download_dir);
    if let Some(bind) = bind {
        config.streaming.bind_address = bind;
    }
    println!("Serving on http://{}", config.streaming.bind_address);
    eddy_web::run_server(config).await?;
    Ok(())
}

/// Downloads a torrent to completion, printing progress once a second.
///
/// # Errors
/// - Torrent file unreadable, metadata unavailable or data not writable
pub async fn download(source: String, download_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = config(download_dir);
    let source = if source.starts_with("magnet:") {
        TorrentSource::Magnet(source)
    } else {
        let bytes = fs::read(&source)
            .await
            .with_context(|| format!("reading {source}"))?;
        TorrentSource::Descriptor(bytes)
    };

    let transport = SwarmTransport::tcp(&config)?;
    let engine = spawn_engine(config, transport);
    let handle = engine.open(source).await?;
    let metadata = Arc::clone(handle.metadata());
    println!("Downloading {} ({})", metadata.name, metadata.info_hash);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break Ok(false),
        }
        let snapshot = handle.snapshot();
        println!(
            "{:>6.2}%  {}/{} pieces  {} peers  {:.1} KiB/s down  {:.1} KiB/s up  {}",
            snapshot.progress_percent,
            snapshot.completed_pieces,
            snapshot.total_pieces,
            snapshot.peer_count,
            snapshot.download_rate as f64 / 1024.0,
            snapshot.upload_rate as f64 / 1024.0,
            snapshot.state,
        );
        match snapshot.state {
            SessionState::Complete => break Ok(true),
            SessionState::Closed => break Err(anyhow::anyhow!("session closed unexpectedly")),
            _ => {}
        }
    };

    engine.shutdown().await?;
    if outcome? {
        println!("Download complete");
    } else {
        println!("Download interrupted");
    }
    Ok(())
}

/// Prints name, info hash, piece layout and files of a torrent.
///
/// # Errors
/// - File unreadable or not a valid torrent
pub async fn info(torrent: PathBuf) -> anyhow::Result<()> {
    let bytes = fs::read(&torrent)
        .await
        .with_context(|| format!("reading {}", torrent.display()))?;
    let metadata = BencodeParser::parse_torrent(&bytes)?;

    println!("Name:       {}", metadata.name);
    println!("Info hash:  {}", metadata.info_hash);
    println!(
        "Pieces:     {} x {} bytes",
        metadata.piece_count(),
        metadata.piece_length
    );
    println!("Total size: {} bytes", metadata.total_length);
    for tracker in &metadata.announce_urls {
        println!("Tracker:    {tracker}");
    }
    println!("Files:");
    for file in &metadata.files {
        let pieces = match (file.first_piece(), file.last_piece()) {
            (Some(first), Some(last)) => format!("pieces {first}-{last}"),
            _ => "empty".to_string(),
        };
        println!(
            "  [{}] {} ({} bytes, {pieces})",
            file.index,
            file.display_path(),
            file.length
        );
    }
    Ok(())
}

/// Prints ranked search results.
///
/// # Errors
/// - Empty query or the indexer could not be reached
pub async fn search(query: String, category: Option<String>) -> anyhow::Result<()> {
    let config = EddyConfig::from_env();
    let search = TorrentSearch::new(Arc::new(HttpSearchProvider::new(&config.search)));
    let results = search.search(&query, category.as_deref()).await?;
    if results.is_empty() {
        println!("No results for {query:?}");
    }
    for result in results {
        println!(
            "{:<10} {:>9} {:>5} seeders  {}",
            format!("{:?}", result.quality),
            result.format_size(),
            result.seeders,
            result.name
        );
        println!("           {}", result.magnet_link);
    }
    Ok(())
}
