use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the piboot workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the full test suite
    Test,
    /// Scaffold an empty blob store (raspberrypi/ and cm4/ subdirectories)
    InitBlobs {
        /// Where to create the store
        #[arg(default_value = "blobs")]
        root: PathBuf,
    },
    /// Run the piboot CLI against a blob store
    Run {
        /// Blob store to serve from
        #[arg(default_value = "blobs")]
        root: PathBuf,
    },
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => cargo(&["build", "--workspace"])?,
        Commands::Test => cargo(&["test", "--workspace"])?,
        Commands::InitBlobs { root } => {
            std::fs::create_dir_all(root.join("raspberrypi"))?;
            std::fs::create_dir_all(root.join("cm4"))?;
            println!(
                "created {}; drop bootcode.bin and the stage-2 files into each subdirectory",
                root.display()
            );
        }
        Commands::Run { root } => {
            let root = root.to_string_lossy().into_owned();
            cargo(&["run", "-p", "piboot-cli", "--", "--blob-root", &root])?;
        }
    }

    Ok(())
}
