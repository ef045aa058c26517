//! Client handle for the run loop.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::{ContextSize, Identity};
use crate::error::{EngineError, Result, StateViolation};
use crate::generation::GenerationStream;
use crate::state::BenchParams;

use super::request::EngineRequest;
use super::service::SharedSettings;

/// Operations application code performs against the engine.
///
/// Async methods suspend the caller until the run loop has executed the
/// corresponding request. Implementations are cheap to share behind an `Arc`.
#[async_trait]
pub trait LlamaClient: Send + Sync {
    // === Lifecycle ===

    /// Allocate model, context, batch and sampler for `path`.
    ///
    /// Fails with `InvalidState(AlreadyLoaded)` if an engine is loaded and
    /// with `AllocationFailed` if a native constructor returns null.
    async fn load(&self, path: &Path) -> Result<()>;

    /// Release the engine. Does nothing when idle.
    async fn unload(&self) -> Result<()>;

    /// Set the context size used by the next `load`.
    fn set_context_size(&self, size: u32) -> Result<()>;

    /// Context size the next `load` will use.
    fn context_size(&self) -> ContextSize;

    /// Set the names used to format prompts. Only permitted while idle.
    fn initialize(&self, identity: Identity) -> Result<()>;

    fn identity(&self) -> Identity;

    // === Generation ===

    /// Stream the reply to `prompt`. Empty when no model is loaded.
    fn send(&self, prompt: &str) -> GenerationStream;

    /// Like [`LlamaClient::send`] with an explicit chat-template flag.
    fn send_with(&self, prompt: &str, format_chat: bool) -> GenerationStream;

    // === Diagnostics ===

    /// Run the synthetic benchmark on the loaded engine.
    async fn bench(&self, params: BenchParams) -> Result<String>;

    async fn system_info(&self) -> Result<String>;

    async fn is_loaded(&self) -> Result<bool>;

    /// Fails with `EngineFault` while the engine is latched unusable.
    async fn health_check(&self) -> Result<()>;

    /// Release everything and stop the run loop.
    async fn shutdown(&self) -> Result<()>;
}

/// Lightweight, cloneable handle to a running [`RunLoop`].
///
/// All clones talk to the same run loop. When the last clone is dropped the
/// run loop unloads the engine and exits.
///
/// [`RunLoop`]: super::RunLoop
#[derive(Clone)]
pub struct RunLoopClient {
    sender: mpsc::UnboundedSender<EngineRequest>,
    settings: Arc<SharedSettings>,
    format_chat: bool,
}

impl RunLoopClient {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<EngineRequest>,
        settings: Arc<SharedSettings>,
        format_chat: bool,
    ) -> Self {
        Self {
            sender,
            settings,
            format_chat,
        }
    }

    /// Submit a request and wait for its reply.
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(request(tx))
            .map_err(|_| EngineError::fault("run loop has stopped"))?;
        rx.await
            .map_err(|_| EngineError::fault("run loop dropped the request"))?
    }
}

#[async_trait]
impl LlamaClient for RunLoopClient {
    async fn load(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.call(|reply| EngineRequest::Load { path, reply }).await
    }

    async fn unload(&self) -> Result<()> {
        self.call(|reply| EngineRequest::Unload { reply }).await
    }

    fn set_context_size(&self, size: u32) -> Result<()> {
        let size = ContextSize::new(size)?;
        debug!(size = size.get(), "Context size set for next load");
        self.settings.set_context_size(size);
        Ok(())
    }

    fn context_size(&self) -> ContextSize {
        self.settings.context_size()
    }

    fn initialize(&self, identity: Identity) -> Result<()> {
        if self.settings.is_loaded() {
            return Err(StateViolation::IdentityWhileLoaded.into());
        }
        self.settings.set_identity(identity);
        Ok(())
    }

    fn identity(&self) -> Identity {
        self.settings.identity().as_ref().clone()
    }

    fn send(&self, prompt: &str) -> GenerationStream {
        self.send_with(prompt, self.format_chat)
    }

    fn send_with(&self, prompt: &str, format_chat: bool) -> GenerationStream {
        let (pull_tx, pull_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = oneshot::channel();

        let request = EngineRequest::Generate {
            prompt: prompt.to_string(),
            format_chat,
            pulls: pull_rx,
            report: report_tx,
        };
        match self.sender.send(request) {
            Ok(()) => GenerationStream::new(pull_tx, report_rx),
            Err(_) => GenerationStream::rejected(EngineError::fault("run loop has stopped")),
        }
    }

    async fn bench(&self, params: BenchParams) -> Result<String> {
        self.call(|reply| EngineRequest::Bench { params, reply }).await
    }

    async fn system_info(&self) -> Result<String> {
        self.call(|reply| EngineRequest::SystemInfo { reply }).await
    }

    async fn is_loaded(&self) -> Result<bool> {
        self.call(|reply| EngineRequest::IsLoaded { reply }).await
    }

    async fn health_check(&self) -> Result<()> {
        self.call(|reply| EngineRequest::HealthCheck { reply }).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.call(|reply| EngineRequest::Shutdown { reply }).await
    }
}
