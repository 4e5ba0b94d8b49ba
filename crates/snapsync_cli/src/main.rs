//! Snapsync CLI
//!
//! Command-line tools for Snapsync databases.
//!
//! # Commands
//!
//! - `inspect` - Display header, counts and collections
//! - `dump-log` - Dump durable log entries for debugging
//! - `verify` - Check every frame and replay the log
//! - `compact` - Fold acknowledged entries into the snapshot
//! - `add-photo` - Downscale, encode and append a photo
//! - `list` - List the items of a collection
//! - `sync-demo` - Sync against an in-process authority

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Snapsync command-line database tools.
#[derive(Parser)]
#[command(name = "snapsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display header, counts and collections
    Inspect {
        /// List every collection with its member count
        #[arg(short, long)]
        collections: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump durable log entries for debugging
    DumpLog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this sequence number
        #[arg(short, long, default_value = "1")]
        from: u64,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        format: String,
    },

    /// Check every frame and replay the log
    Verify,

    /// Fold acknowledged entries into the snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Downscale, encode and append a photo
    AddPhoto {
        /// Target collection
        #[arg(short, long, default_value = "photos")]
        collection: String,

        /// Caption
        #[arg(short, long)]
        text: String,

        /// Source image file
        #[arg(short, long)]
        image: PathBuf,
    },

    /// List the items of a collection
    List {
        /// Collection to list
        #[arg(short, long, default_value = "photos")]
        collection: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sync against an in-process authority until every entry is acknowledged
    SyncDemo {
        /// Give up after this many seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            collections,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, collections, &format)?;
        }
        Commands::DumpLog {
            limit,
            from,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump-log")?;
            commands::dump_log::run(&path, from, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Database path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::AddPhoto {
            collection,
            text,
            image,
        } => {
            let path = cli.path.ok_or("Database path required for add-photo")?;
            commands::add_photo::run(&path, &collection, &text, &image)?;
        }
        Commands::List { collection, format } => {
            let path = cli.path.ok_or("Database path required for list")?;
            commands::list::run(&path, &collection, &format)?;
        }
        Commands::SyncDemo { timeout } => {
            let path = cli.path.ok_or("Database path required for sync-demo")?;
            commands::sync_demo::run(&path, std::time::Duration::from_secs(timeout))?;
        }
        Commands::Version => {
            println!("Snapsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Snapsync Core v{}", snapsync_core::VERSION);
            println!(
                "Sync protocol v{}",
                snapsync_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
