//! shapesync CLI
//!
//! Command-line tools for shapesync.
//!
//! # Commands
//!
//! - `demo` - Run two partitioned shapes over a simulated source and print
//!   every published batch

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// shapesync command-line tools.
#[derive(Parser)]
#[command(name = "shapesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a partitioned table and print every published batch
    Demo {
        /// Publish whole transactions only
        #[arg(short, long)]
        transactional: bool,

        /// Delay before lagging shapes are refreshed, in milliseconds
        #[arg(long, default_value = "100")]
        check_after_ms: u64,

        /// Number of rows to insert
        #[arg(short, long, default_value = "6")]
        rows: u64,

        /// Priority at or below which rows belong to the low shape
        #[arg(long, default_value = "10")]
        threshold: i64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Demo {
            transactional,
            check_after_ms,
            rows,
            threshold,
            format,
        } => {
            let options = commands::demo::DemoOptions {
                transactional,
                check_after: std::time::Duration::from_millis(check_after_ms),
                rows,
                threshold,
                format: format.parse()?,
            };
            commands::demo::run(options).await?;
        }
        Commands::Version => {
            println!("shapesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
