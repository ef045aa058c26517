//! llm-runloop binary - chat, benchmark and inspect a llama.cpp engine
//!
//! This binary provides the command-line entry point over the run loop.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_runloop::cli::commands::Commands;
use llm_runloop::cli::{handle_bench, handle_chat, handle_info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Default log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they do not interleave with streamed replies
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .parse_lossy(std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    info!("llm-runloop starting up");

    match cli.command {
        Commands::Chat(cmd) => handle_chat(cmd).await,
        Commands::Bench(cmd) => handle_bench(cmd).await,
        Commands::Info(cmd) => handle_info(cmd).await,
    }
}
