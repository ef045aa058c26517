//! The run loop thread.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument};

use crate::config::{BatchConfig, ContextSize, Identity, RunLoopConfig};
use crate::error::{EngineError, Result};
use crate::generation::{self, guard_native, GenerationPlan};
use crate::native::{DynamicEngine, EngineAbi};
use crate::prompt::format_turn;
use crate::state::EngineCore;

use super::client::RunLoopClient;
use super::request::EngineRequest;

/// Name of the thread that owns the native engine.
pub const RUN_LOOP_THREAD: &str = "llm-runloop";

/// Values callers may change without going through the run loop.
///
/// The run loop reads the context size when a load executes and snapshots
/// the identity when a generation is dequeued. `loaded` mirrors the resource
/// state after every load and unload.
pub(crate) struct SharedSettings {
    context_size: AtomicU32,
    identity: ArcSwap<Identity>,
    loaded: AtomicBool,
}

impl SharedSettings {
    fn new(config: &RunLoopConfig) -> Result<Self> {
        Ok(Self {
            context_size: AtomicU32::new(config.context_size()?.get()),
            identity: ArcSwap::from_pointee(config.identity.clone()),
            loaded: AtomicBool::new(false),
        })
    }

    pub(crate) fn context_size(&self) -> ContextSize {
        ContextSize::new(self.context_size.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn set_context_size(&self, size: ContextSize) {
        self.context_size.store(size.get(), Ordering::Release);
    }

    pub(crate) fn identity(&self) -> Arc<Identity> {
        self.identity.load_full()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        self.identity.store(Arc::new(identity));
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }
}

/// Execution serializer for the native engine.
///
/// The run loop owns the engine on a dedicated thread and processes requests
/// strictly in submission order. Native calls never overlap and never run on
/// any other thread.
pub struct RunLoop {
    core: EngineCore,
    requests: mpsc::UnboundedReceiver<EngineRequest>,
    settings: Arc<SharedSettings>,
    batch: BatchConfig,
    max_response_len: i32,
}

impl RunLoop {
    /// Open the configured native library and start the run loop.
    ///
    /// # Example
    /// ```rust,ignore
    /// let client = RunLoop::start(RunLoopConfig::default()).await?;
    /// client.load(Path::new("/models/tinyllama.Q4_0.gguf")).await?;
    /// ```
    #[instrument(skip_all, fields(library = %config.library.display()))]
    pub async fn start(config: RunLoopConfig) -> Result<RunLoopClient> {
        let library = config.library.clone();
        Self::start_with(config, move || {
            DynamicEngine::open(&library).map(|engine| Box::new(engine) as Box<dyn EngineAbi>)
        })
        .await
    }

    /// Start the run loop with a custom engine loader.
    ///
    /// `loader` runs on the run loop thread, so the engine it returns is
    /// created, used and dropped on that thread only.
    pub async fn start_with<F>(config: RunLoopConfig, loader: F) -> Result<RunLoopClient>
    where
        F: FnOnce() -> Result<Box<dyn EngineAbi>> + Send + 'static,
    {
        config.validate()?;
        info!("Starting run loop");

        let settings = Arc::new(SharedSettings::new(&config)?);
        let format_chat = config.format_chat;
        let (tx, rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel();

        let thread_settings = settings.clone();
        std::thread::Builder::new()
            .name(RUN_LOOP_THREAD.to_string())
            .spawn(move || {
                debug!("Dedicated thread for native code started");
                match Self::initialize(loader, &config, thread_settings, rx) {
                    Ok(run_loop) => {
                        let _ = init_tx.send(Ok(()));
                        run_loop.run();
                    }
                    Err(e) => {
                        error!("Run loop startup failed: {}", e);
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| EngineError::fault(format!("failed to spawn run loop thread: {}", e)))?;

        init_rx
            .await
            .map_err(|_| EngineError::fault("run loop died during startup"))??;

        info!("Run loop started");
        Ok(RunLoopClient::new(tx, settings, format_chat))
    }

    /// Load the library, route its logs and bring the backend up (run loop thread).
    fn initialize<F>(
        loader: F,
        config: &RunLoopConfig,
        settings: Arc<SharedSettings>,
        requests: mpsc::UnboundedReceiver<EngineRequest>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn EngineAbi>>,
    {
        let abi = guard_native("library load", loader)??;
        let mut core = EngineCore::new(abi);
        guard_native("backend_init", || core.start_backend(config.numa))?;

        Ok(Self {
            core,
            requests,
            settings,
            batch: config.batch,
            max_response_len: config.max_response_len,
        })
    }

    /// Main loop - processes requests until shutdown or every client is gone.
    fn run(mut self) {
        debug!("Run loop processing requests");
        let mut shutdown_reply = None;

        while let Some(request) = self.requests.blocking_recv() {
            debug!(?request, "Processing request");
            if let Some(reply) = self.handle_request(request) {
                shutdown_reply = Some(reply);
                break;
            }
        }

        self.requests.close();
        self.teardown();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(Ok(()));
        }
        info!("Run loop ended");
    }

    /// Handle a single request. Returns the reply channel of a shutdown.
    fn handle_request(&mut self, request: EngineRequest) -> Option<oneshot::Sender<Result<()>>> {
        match request {
            EngineRequest::Load { path, reply } => {
                let result = self.load(&path);
                let _ = reply.send(result);
            }

            EngineRequest::Unload { reply } => {
                let result = self.guarded("unload", |core| {
                    core.unload();
                    Ok(())
                });
                self.settings.set_loaded(self.core.is_loaded());
                let _ = reply.send(result);
            }

            EngineRequest::Generate {
                prompt,
                format_chat,
                pulls,
                report,
            } => {
                let identity = self.settings.identity();
                let plan = GenerationPlan {
                    text: format_turn(&identity, &prompt),
                    format_chat,
                    max_len: self.max_response_len,
                };

                let (result, fault) = match self.core.generation_parts() {
                    Ok(engine) => generation::drive(engine, plan, pulls),
                    Err(e) => (generation::reject(pulls, e), None),
                };
                if let Some(reason) = fault {
                    self.core.latch_fault(reason);
                }
                let _ = report.send(result);
            }

            EngineRequest::Bench { params, reply } => {
                let result = self.guarded("bench", |core| core.bench(params));
                let _ = reply.send(result);
            }

            EngineRequest::SystemInfo { reply } => {
                let result = self.guarded("system_info", |core| Ok(core.system_info()));
                let _ = reply.send(result);
            }

            EngineRequest::IsLoaded { reply } => {
                let _ = reply.send(Ok(self.core.is_loaded()));
            }

            EngineRequest::HealthCheck { reply } => {
                let result = match self.core.fault() {
                    Some(reason) => Err(EngineError::fault(reason.to_string())),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }

            EngineRequest::Shutdown { reply } => {
                info!("Shutdown requested");
                return Some(reply);
            }
        }
        None
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let context_size = self.settings.context_size();
        let batch = self.batch;
        let result = self.guarded("load", |core| core.load(path, context_size, batch));
        self.settings.set_loaded(self.core.is_loaded());
        result
    }

    /// Run an engine operation, latching a fault if it panics.
    fn guarded<T>(&mut self, op: &str, f: impl FnOnce(&mut EngineCore) -> Result<T>) -> Result<T> {
        let core = &mut self.core;
        match guard_native(op, || f(core)) {
            Ok(result) => result,
            Err(fault) => {
                self.core.latch_fault(fault.to_string());
                Err(fault)
            }
        }
    }

    fn teardown(&mut self) {
        let core = &mut self.core;
        if let Err(e) = guard_native("shutdown", || core.shutdown()) {
            error!("Teardown failed: {}", e);
        }
        self.settings.set_loaded(false);
    }
}
