use clap::Args;
use std::path::PathBuf;

use crate::config::ConfigArgs;
use crate::state::BenchParams;

/// Run the synthetic benchmark against a GGUF model
#[derive(Args)]
pub struct BenchCommand {
    /// Path to the .gguf model file
    pub model: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Prompt processing tokens
    #[arg(long, default_value = "512")]
    pub pp: i32,

    /// Text generation tokens
    #[arg(long, default_value = "128")]
    pub tg: i32,

    /// Parallel sequences
    #[arg(long, default_value = "1")]
    pub pl: i32,

    /// Repetitions
    #[arg(long, default_value = "1")]
    pub reps: i32,
}

impl BenchCommand {
    pub fn params(&self) -> BenchParams {
        BenchParams {
            pp: self.pp,
            tg: self.tg,
            pl: self.pl,
            reps: self.reps,
        }
    }
}
