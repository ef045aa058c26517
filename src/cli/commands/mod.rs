pub mod bench;
pub mod chat;

pub use bench::BenchCommand;
pub use chat::ChatCommand;

use clap::{Args, Subcommand};

use crate::config::ConfigArgs;

#[derive(Subcommand)]
pub enum Commands {
    /// Chat with a GGUF model
    Chat(ChatCommand),
    /// Run the synthetic benchmark against a GGUF model
    Bench(BenchCommand),
    /// Print the engine build description
    Info(InfoCommand),
}

/// Print the engine build description
#[derive(Args)]
pub struct InfoCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}
