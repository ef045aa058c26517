//! Configuration management for the run loop.
//!
//! Configuration is assembled from, in order of precedence:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `LLM_RUNLOOP_`, nested keys joined by `__`)
//! 4. Command-line arguments
//!
//! # Environment Variables
//!
//! - `LLM_RUNLOOP_LIBRARY` - Native shim library to open
//! - `LLM_RUNLOOP_CONTEXT_SIZE` - Context size used by the next load
//! - `LLM_RUNLOOP_IDENTITY__USER` - User display name

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Smallest context the engine accepts.
pub const MIN_CONTEXT_SIZE: u32 = 512;
/// Largest context the engine accepts.
pub const MAX_CONTEXT_SIZE: u32 = 32768;

/// Context size validated against the supported range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextSize(u32);

impl ContextSize {
    pub fn new(size: u32) -> Result<Self> {
        if (MIN_CONTEXT_SIZE..=MAX_CONTEXT_SIZE).contains(&size) {
            Ok(Self(size))
        } else {
            Err(EngineError::config(format!(
                "Context size must be between {} and {}, got {}",
                MIN_CONTEXT_SIZE, MAX_CONTEXT_SIZE, size
            )))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for ContextSize {
    fn default() -> Self {
        Self(8192)
    }
}

/// Display names used when formatting a conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub assistant: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new("User", "Assistant")
    }
}

/// Arguments for `newBatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Token capacity of the batch
    #[serde(default = "default_batch_tokens")]
    pub tokens: i32,
    /// Embedding size (0 for token batches)
    #[serde(default)]
    pub embd: i32,
    /// Maximum number of sequences
    #[serde(default = "default_batch_seqs")]
    pub seqs: i32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            tokens: default_batch_tokens(),
            embd: 0,
            seqs: default_batch_seqs(),
        }
    }
}

/// Run loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLoopConfig {
    /// Native shim library name or path
    #[serde(default = "default_library")]
    pub library: PathBuf,
    /// Context size for the next load
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Hard upper bound on the generation cursor
    #[serde(default = "default_max_response_len")]
    pub max_response_len: i32,
    /// Batch allocation parameters
    #[serde(default)]
    pub batch: BatchConfig,
    /// Passed to backend initialization
    #[serde(default)]
    pub numa: bool,
    /// Apply the model's chat template during completion init
    #[serde(default)]
    pub format_chat: bool,
    /// Prompt identity
    #[serde(default)]
    pub identity: Identity,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            library: default_library(),
            context_size: default_context_size(),
            max_response_len: default_max_response_len(),
            batch: BatchConfig::default(),
            numa: false,
            format_chat: false,
            identity: Identity::default(),
        }
    }
}

/// Command-line overrides shared by every subcommand.
#[derive(Debug, Default, Clone, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Native shim library to open
    #[arg(long, env = "LLM_RUNLOOP_LIBRARY")]
    pub library: Option<PathBuf>,

    /// Context size (512-32768)
    #[arg(long)]
    pub context_size: Option<u32>,

    /// Maximum response length in tokens
    #[arg(long)]
    pub max_response_len: Option<i32>,

    /// User display name
    #[arg(long)]
    pub user_name: Option<String>,

    /// Assistant display name
    #[arg(long)]
    pub assistant_name: Option<String>,

    /// Enable NUMA optimizations in the backend
    #[arg(long)]
    pub numa: bool,
}

impl RunLoopConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LLM_RUNLOOP")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: RunLoopConfig = builder.build()?.try_deserialize()?;

        if let Some(library) = &args.library {
            config.library = library.clone();
        }
        if let Some(size) = args.context_size {
            config.context_size = size;
        }
        if let Some(len) = args.max_response_len {
            config.max_response_len = len;
        }
        if let Some(user) = &args.user_name {
            config.identity.user = user.clone();
        }
        if let Some(assistant) = &args.assistant_name {
            config.identity.assistant = assistant.clone();
        }
        if args.numa {
            config.numa = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        ContextSize::new(self.context_size)?;
        if self.max_response_len <= 0 {
            return Err(EngineError::config("max_response_len must be positive"));
        }
        if self.batch.tokens <= 0 || self.batch.seqs <= 0 {
            return Err(EngineError::config("batch tokens and seqs must be positive"));
        }
        Ok(())
    }

    pub fn context_size(&self) -> Result<ContextSize> {
        ContextSize::new(self.context_size)
    }
}

/// Reject model files that are not GGUF.
pub fn validate_model_path(path: &Path) -> Result<()> {
    let is_gguf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false);
    if is_gguf {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "Please select a .gguf file, got {}",
            path.display()
        )))
    }
}

fn default_library() -> PathBuf {
    PathBuf::from("libllama-runloop.so")
}

fn default_context_size() -> u32 {
    8192
}

fn default_max_response_len() -> i32 {
    4096
}

fn default_batch_tokens() -> i32 {
    2048
}

fn default_batch_seqs() -> i32 {
    1
}
