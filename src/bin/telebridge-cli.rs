//! Telebridge operator CLI
//!
//! Drives the bridge lifecycle and response views from a shell, using the
//! same component stack as the MCP server.

use clap::{Parser, Subcommand};
use telebridge::config::Config;
use telebridge::runtime::CoreRuntime;
use telebridge::time_provider::production_time_provider;
use tokio_util::sync::CancellationToken;

/// Telebridge CLI - operate the delivery bridge and inspect responses
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the delivery bridge and wait until it is ready
    Start,
    /// Stop every running delivery bridge process
    Stop,
    /// Restart the delivery bridge
    Restart,
    /// Show full bridge status
    Status,
    /// List recent user responses
    Responses {
        /// Maximum entries to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show pending approvals and denials
    Pending {
        /// Look-back window in minutes
        #[arg(long, default_value_t = 10)]
        since_minutes: u64,
    },
    /// Delete responses older than the given age
    Clear {
        /// Age threshold in hours
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    let runtime = CoreRuntime::build(config, production_time_provider())?;
    let components = &runtime.components;
    let cancel = CancellationToken::new();

    match args.command {
        Command::Start => {
            let pid = components.bridge.start().await?;
            components.bridge.wait_for_ready(&cancel).await?;
            println!("bridge started, pid {pid}");
        }
        Command::Stop => {
            let terminated = components.bridge.stop().await?;
            println!("terminated {terminated} bridge process(es)");
        }
        Command::Restart => {
            let pid = components.bridge.restart(&cancel).await?;
            println!("bridge restarted, pid {pid}");
        }
        Command::Status => {
            let status = components.bridge.status(&cancel).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Responses { limit } => {
            let view = components.responses.list(limit).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Pending { since_minutes } => {
            let view = components.responses.process_pending(since_minutes).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Clear { older_than_hours } => {
            let deleted = components.responses.clear_older_than(older_than_hours).await?;
            println!("deleted {deleted} response file(s)");
        }
    }
    Ok(())
}
