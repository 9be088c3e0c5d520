//! Enforce space allocations on a directory tree shared by cooperating server processes.
use std::path::PathBuf;

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use tracing::error;

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Directory-tree space allocations for multi-process storage servers."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a quotad config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild allocation state from the tree and print the totals.
    Init,

    /// Show the allocation governing a directory.
    Info {
        /// Directory, relative to the storage root.
        path: PathBuf,
    },

    /// Create a directory as a new allocation.
    Mkalloc {
        /// Directory to create, relative to the storage root.
        path: PathBuf,
        /// Capacity of the new allocation, e.g. "512 MiB".
        size: ByteSize,
    },

    /// Remove an allocation and everything in it.
    Rmalloc {
        /// Directory to remove, relative to the storage root.
        path: PathBuf,
    },

    /// Show filesystem statistics as seen through allocations.
    Df {
        /// Path, relative to the storage root.
        #[arg(default_value = "/")]
        path: PathBuf,
    },

    /// Recover, then keep publishing allocation state until interrupted.
    Serve,
}

/// Virtual paths are always absolute within the storage root.
fn virtual_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        PathBuf::from("/").join(path)
    }
}

fn size_of(bytes: i64) -> ByteSize {
    ByteSize::b(u64::try_from(bytes).unwrap_or_default())
}

async fn run(config: Config, command: Command) -> Result<(), std::io::Error> {
    match command {
        Command::Serve => daemon::serve(config).await,
        Command::Init => {
            let (_manager, summary) = daemon::initialize(&config).await?;
            match summary {
                Some(summary) => {
                    println!("root:      {}", summary.root.display());
                    println!("total:     {}", size_of(summary.total_size));
                    println!("in use:    {}", size_of(summary.in_use));
                    println!("available: {}", size_of(summary.available));
                    println!("scan took: {:?}", summary.elapsed);
                }
                None => println!("allocations are disabled"),
            }
            Ok(())
        }
        Command::Info { path } => {
            let manager = daemon::attach(&config);
            let info = manager.query_info(&virtual_path(path)).await;
            manager.flush().await?;
            let info = info?;
            println!("root:      {}", info.root.display());
            println!("total:     {}", size_of(info.total_size));
            println!("in use:    {}", size_of(info.in_use));
            println!("available: {}", size_of(info.available()));
            Ok(())
        }
        Command::Mkalloc { path, size } => {
            let manager = daemon::attach(&config);
            manager
                .mkalloc(&virtual_path(path), size.as_u64(), 0o755)
                .await?;
            Ok(())
        }
        Command::Rmalloc { path } => {
            let manager = daemon::attach(&config);
            let removed = manager.rmall(&virtual_path(path)).await;
            manager.flush().await?;
            Ok(removed?)
        }
        Command::Df { path } => {
            let manager = daemon::attach(&config);
            let stats = manager.statfs(&virtual_path(path)).await;
            manager.flush().await?;
            let stats = stats?;
            let block = stats.block_size;
            println!("block size: {}", ByteSize::b(block));
            println!("total:      {}", ByteSize::b(stats.total_blocks.saturating_mul(block)));
            println!("free:       {}", ByteSize::b(stats.free_blocks.saturating_mul(block)));
            println!("available:  {}", ByteSize::b(stats.available_blocks.saturating_mul(block)));
            Ok(())
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        });

    let command = args.command.unwrap_or(Command::Serve);
    if let Err(e) = runtime.block_on(run(config, command)) {
        error!("{e}");
        std::process::exit(1);
    }
}
