use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use piboot_core::{
    FsBlobProvider, RusbHost, Scanner, ScannerConfig, ScannerEvent, ScannerObserver,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "piboot",
    author,
    version,
    about = "Raspberry Pi USB boot host (Pure Rust)",
    long_about = "Serves the Broadcom ROM boot protocol to any compute module or Zero \
                  plugged in over USB until it re-enumerates as mass storage."
)]
struct Args {
    /// Root of the blob store (<root>/raspberrypi, <root>/cm4)
    #[arg(long)]
    blob_root: Option<PathBuf>,

    /// Load scanner configuration from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// CLI observer that prints session progress to stderr.
struct CliObserver;

impl ScannerObserver for CliObserver {
    fn on_event(&self, event: &ScannerEvent) {
        match event {
            ScannerEvent::Attach { session } => {
                eprintln!("✓ {} attached ({})", session.port_id, session.family);
            }
            ScannerEvent::Detach { session } => {
                if session.step == session.last_step {
                    eprintln!("\n✓ {} is mass storage now", session.port_id);
                } else {
                    eprintln!("\n✗ {} gone at step {}", session.port_id, session.step);
                }
            }
            ScannerEvent::Progress { session, percent } => {
                eprint!("\r[{percent:>3}%] {}", session.port_id);
            }
            ScannerEvent::Ready => {
                eprintln!("Waiting for BCM2708/BCM2710/BCM2711 devices...");
            }
            ScannerEvent::Error { message } => {
                eprintln!("✗ {message}");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = match &args.config {
        Some(path) => ScannerConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ScannerConfig::default(),
    };
    if let Some(blob_root) = args.blob_root {
        config.blob_root = blob_root;
    }

    info!(blob_root = %config.blob_root.display(), "piboot starting");

    let host = RusbHost::new().context("initializing USB")?;
    let blobs = FsBlobProvider::new(&config.blob_root);
    let mut scanner = Scanner::new(host, blobs, &config, Arc::new(CliObserver));
    scanner.start().context("starting scanner")?;

    // Serve devices until killed.
    loop {
        std::thread::park();
    }
}
