//! Native engine boundary.
//!
//! [`EngineAbi`] is the complete set of calls the run loop makes into the
//! inference engine. Every method is invoked on the run loop thread only, so
//! implementations need not be `Send` or `Sync` and may rely on thread-local
//! state inside the native library.
//!
//! [`DynamicEngine`] binds the trait to a C shim around llama.cpp opened at
//! runtime; tests substitute an in-process implementation.

mod dynamic;

pub use dynamic::DynamicEngine;

use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;

use crate::error::Result;

/// Opaque, non-null identifier of a native allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    /// Wrap a value returned across the boundary; zero is the null handle.
    pub fn from_raw(raw: i64) -> Option<Self> {
        NonZeroU64::new(raw as u64).map(Self)
    }

    pub fn as_raw(self) -> i64 {
        self.0.get() as i64
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0.get())
    }
}

/// Calls into the native inference engine.
///
/// Constructors return `None` for a null handle. `free_*` must be called at
/// most once per handle; the guards in [`crate::handles`] enforce that.
pub trait EngineAbi {
    /// Route native log output into `tracing`.
    fn install_log_hook(&mut self);

    fn backend_init(&mut self, numa: bool);

    fn backend_free(&mut self);

    /// Static description of the engine build.
    fn system_info(&mut self) -> String;

    fn load_model(&mut self, path: &Path) -> Option<RawHandle>;

    fn free_model(&mut self, model: RawHandle);

    fn new_context(&mut self, model: RawHandle, n_ctx: u32) -> Option<RawHandle>;

    fn free_context(&mut self, context: RawHandle);

    fn new_batch(&mut self, n_tokens: i32, embd: i32, n_seq_max: i32) -> Option<RawHandle>;

    fn free_batch(&mut self, batch: RawHandle);

    fn new_sampler(&mut self) -> Option<RawHandle>;

    fn free_sampler(&mut self, sampler: RawHandle);

    /// Tokenize and decode `text`; returns the starting cursor.
    fn completion_init(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        text: &str,
        format_chat: bool,
        n_len: i32,
    ) -> Result<i32>;

    /// Sample one token and advance `cursor`. `None` marks end of generation.
    fn completion_step(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        sampler: RawHandle,
        n_len: i32,
        cursor: &mut i32,
    ) -> Option<String>;

    fn clear_cache(&mut self, context: RawHandle);

    #[allow(clippy::too_many_arguments)]
    fn bench(
        &mut self,
        context: RawHandle,
        model: RawHandle,
        batch: RawHandle,
        pp: i32,
        tg: i32,
        pl: i32,
        nr: i32,
    ) -> Result<String>;
}
