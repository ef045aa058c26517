//! Request types for the run loop.
//!
//! These types define the message format between [`RunLoopClient`] and the
//! run loop thread.
//!
//! [`RunLoopClient`]: super::RunLoopClient

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::generation::{GenerationReport, Pull};
use crate::state::BenchParams;

/// Requests executed, in order, on the run loop thread.
///
/// All variants carry a oneshot reply channel. A generation additionally
/// carries the receiving end of its pull channel.
pub enum EngineRequest {
    /// Allocate an engine for the model file.
    Load {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Release the engine, if any.
    Unload { reply: oneshot::Sender<Result<()>> },

    /// Run a streaming generation.
    Generate {
        prompt: String,
        format_chat: bool,
        pulls: mpsc::UnboundedReceiver<Pull>,
        report: oneshot::Sender<GenerationReport>,
    },

    /// Synthetic benchmark against the loaded engine.
    Bench {
        params: BenchParams,
        reply: oneshot::Sender<Result<String>>,
    },

    /// Engine build description.
    SystemInfo { reply: oneshot::Sender<Result<String>> },

    /// Whether an engine is allocated.
    IsLoaded { reply: oneshot::Sender<Result<bool>> },

    /// Health check request.
    HealthCheck { reply: oneshot::Sender<Result<()>> },

    /// Release everything and stop the run loop.
    Shutdown { reply: oneshot::Sender<Result<()>> },
}

impl std::fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load { path, .. } => write!(f, "EngineRequest::Load {{ path: {:?} }}", path),
            Self::Unload { .. } => write!(f, "EngineRequest::Unload"),
            Self::Generate {
                prompt,
                format_chat,
                ..
            } => write!(
                f,
                "EngineRequest::Generate {{ prompt_len: {}, format_chat: {} }}",
                prompt.len(),
                format_chat
            ),
            Self::Bench { params, .. } => write!(f, "EngineRequest::Bench {{ {:?} }}", params),
            Self::SystemInfo { .. } => write!(f, "EngineRequest::SystemInfo"),
            Self::IsLoaded { .. } => write!(f, "EngineRequest::IsLoaded"),
            Self::HealthCheck { .. } => write!(f, "EngineRequest::HealthCheck"),
            Self::Shutdown { .. } => write!(f, "EngineRequest::Shutdown"),
        }
    }
}
