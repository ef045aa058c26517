//! Chat command for interactive generation

use clap::Args;
use std::path::PathBuf;

use crate::config::ConfigArgs;

/// Chat with a GGUF model
#[derive(Args)]
pub struct ChatCommand {
    /// Path to the .gguf model file
    pub model: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Apply the model's chat template to each turn
    #[arg(long)]
    pub format_chat: bool,

    /// Single prompt mode (non-interactive)
    #[arg(long)]
    pub prompt: Option<String>,
}
