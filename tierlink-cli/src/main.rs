//! tierlink-cli - Command-line client for tierlink tiers
//!
//! One-shot requests plus burst and sustained load runs over a single
//! persistent connection.

mod commands;
mod load;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::time::Duration;
use tierlink_client::{Client, ConnectionConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tierlink-cli")]
#[command(about = "Command-line client for tierlink edge, switch and core tiers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:5000", env = "TIERLINK_SERVER")]
    server: String,

    /// Per-request timeout in milliseconds
    #[arg(short = 't', long, default_value = "30000")]
    timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "10000")]
    connect_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the server
    Ping,

    /// Look up an account by account number
    Account {
        /// Account number
        number: String,
    },

    /// Send a raw request and print the response envelope
    Send {
        /// Operation name
        operation: String,

        /// Params JSON object (or @file.json to read from file)
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Fire N concurrent requests over one connection
    Burst {
        /// Number of requests
        #[arg(short = 'n', long, default_value = "100")]
        requests: usize,

        #[command(flatten)]
        target: load::LoadTarget,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep C workers calling in a loop for a fixed duration
    Sustain {
        /// Run duration in seconds
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,

        /// Number of concurrent workers
        #[arg(short, long, default_value = "10")]
        concurrency: usize,

        #[command(flatten)]
        target: load::LoadTarget,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig::new(&cli.server)
        .with_connect_timeout(Duration::from_millis(cli.connect_timeout_ms))
        .with_request_timeout(Duration::from_millis(cli.timeout_ms));
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&client, cli.command).await;
    client.close().await;

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
