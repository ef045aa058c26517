//! Resource state machine of the engine.
//!
//! ```text
//!            load (all four handles)
//!   Idle ───────────────────────────▶ Loaded
//!    ▲                                   │
//!    └───────────────────────────────────┘
//!                  unload
//! ```
//!
//! [`EngineCore`] lives on the run loop thread and is the only owner of the
//! native engine and its handles.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::{BatchConfig, ContextSize};
use crate::error::{EngineError, Result, StateViolation};
use crate::handles::EngineHandles;
use crate::native::EngineAbi;

/// Whether an engine instance is allocated.
#[derive(Debug, Default)]
pub enum ResourceState {
    #[default]
    Idle,
    Loaded(EngineHandles),
}

impl ResourceState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// Arguments for the synthetic benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchParams {
    /// Prompt processing tokens
    pub pp: i32,
    /// Text generation tokens
    pub tg: i32,
    /// Parallel sequences
    pub pl: i32,
    /// Repetitions
    pub reps: i32,
}

impl BenchParams {
    pub fn new(pp: i32, tg: i32, pl: i32) -> Self {
        Self {
            pp,
            tg,
            pl,
            ..Default::default()
        }
    }
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            reps: 1,
        }
    }
}

/// Native engine plus the state of its allocations.
pub struct EngineCore {
    abi: Box<dyn EngineAbi>,
    state: ResourceState,
    fault: Option<String>,
}

impl EngineCore {
    pub fn new(abi: Box<dyn EngineAbi>) -> Self {
        Self {
            abi,
            state: ResourceState::Idle,
            fault: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_loaded()
    }

    /// Reason the engine is unusable, if a fault was latched.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Mark the engine unusable until the next `unload`.
    pub fn latch_fault(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Engine latched as faulted: {}", reason);
        self.fault = Some(reason);
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.fault {
            Some(reason) => Err(EngineError::fault(format!(
                "engine unusable after earlier fault ({}); unload first",
                reason
            ))),
            None => Ok(()),
        }
    }

    /// Allocate an engine for `path`. Only permitted from `Idle`.
    pub fn load(
        &mut self,
        path: &Path,
        context_size: ContextSize,
        batch: BatchConfig,
    ) -> Result<()> {
        if self.state.is_loaded() {
            return Err(StateViolation::AlreadyLoaded.into());
        }
        self.ensure_healthy()?;

        let handles = EngineHandles::allocate(self.abi.as_mut(), path, context_size, batch)?;
        info!(
            "Loaded model {} with context size {}",
            path.display(),
            context_size.get()
        );
        self.state = ResourceState::Loaded(handles);
        Ok(())
    }

    /// Free the engine if loaded and clear any latched fault. No-op when idle.
    pub fn unload(&mut self) {
        if let Some(reason) = self.fault.take() {
            debug!("Clearing latched fault: {}", reason);
        }
        match std::mem::take(&mut self.state) {
            ResourceState::Loaded(handles) => {
                handles.release(self.abi.as_mut());
                info!("Model unloaded");
            }
            ResourceState::Idle => debug!("unload() while idle"),
        }
    }

    pub fn bench(&mut self, params: BenchParams) -> Result<String> {
        self.ensure_healthy()?;
        match &self.state {
            ResourceState::Loaded(handles) => {
                debug!(?params, "bench()");
                self.abi.bench(
                    handles.context(),
                    handles.model(),
                    handles.batch(),
                    params.pp,
                    params.tg,
                    params.pl,
                    params.reps,
                )
            }
            ResourceState::Idle => Err(StateViolation::NotLoaded.into()),
        }
    }

    pub fn system_info(&mut self) -> String {
        self.abi.system_info()
    }

    /// Native engine and the loaded handles, for driving a generation.
    pub fn generation_parts(&mut self) -> Result<Option<(&mut dyn EngineAbi, &EngineHandles)>> {
        self.ensure_healthy()?;
        Ok(match &self.state {
            ResourceState::Loaded(handles) => Some((self.abi.as_mut(), handles)),
            ResourceState::Idle => None,
        })
    }

    /// Process startup: route native logs and bring the backend up.
    pub fn start_backend(&mut self, numa: bool) {
        self.abi.install_log_hook();
        self.abi.backend_init(numa);
        info!("{}", self.abi.system_info());
    }

    /// Process teardown: release any engine and shut the backend down.
    pub fn shutdown(&mut self) {
        self.unload();
        self.abi.backend_free();
        debug!("Backend freed");
    }
}
