//! ctxgraph CLI
//!
//! Command-line tools for ctxgraph store directories.
//!
//! # Commands
//!
//! - `inspect` - Summarize the commit log of a store directory
//! - `verify` - Check the commit log for corruption and sequence gaps
//! - `dump-log` - Print persisted commits for debugging
//! - `stress` - Run counter increments through an in-memory coordinator

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ctxgraph command-line tools.
#[derive(Parser)]
#[command(name = "ctxgraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Summarize the commit log
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the commit log for corruption
    Verify,

    /// Print persisted commits
    DumpLog {
        /// Maximum number of commits to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run concurrent counter increments and report lost updates
    Stress {
        /// Number of worker threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Increments per thread
        #[arg(short, long, default_value = "50")]
        increments: usize,

        /// Number of serialization lanes
        #[arg(short, long, default_value = "2")]
        lanes: usize,

        /// Run transactions without lane serialization
        #[arg(short, long)]
        concurrent: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpLog { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-log")?;
            commands::dump_log::run(&path, limit, &format)?;
        }
        Commands::Stress {
            threads,
            increments,
            lanes,
            concurrent,
            format,
        } => {
            let config = ctxgraph_testkit::StressConfig {
                threads,
                increments,
                lanes,
                serial: !concurrent,
            };
            commands::stress::run(&config, &format)?;
        }
        Commands::Version => {
            println!("ctxgraph CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("ctxgraph core v{}", ctxgraph_core::VERSION);
        }
    }

    Ok(())
}
