//! File server entry point.

use clap::Parser;
use evio::EventLoop;
use fileserver::config::Config;
use fileserver::{logging, signal, FileServer};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fileserver", about = "Chunked file upload/download server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "etc/fileserver.toml")]
    config: PathBuf,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = if args.config.is_file() {
        Config::load(&args.config)?
    } else {
        // Fall back to built-in defaults so a bare binary still runs.
        Config::default()
    };
    if let Some(port) = args.port {
        config.server.listen_port = port;
    }

    logging::init(&config.logging);
    if !args.config.is_file() {
        warn!(path = %args.config.display(), "config file not found, using defaults");
    }

    let mut base_loop = EventLoop::with_poller(config.server.poller)?;
    signal::install(base_loop.handle());

    let server = FileServer::new(base_loop.handle(), &config.server, &config.storage.cache_dir)?;
    server.start();
    info!(
        addr = %server.listen_address()?.to_ip_port(),
        workers = config.server.worker_threads,
        cache = %config.storage.cache_dir.display(),
        "file server ready"
    );

    base_loop.run();

    server.stop();
    info!("file server exited");
    Ok(())
}
