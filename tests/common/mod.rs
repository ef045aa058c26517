//! Common test utilities: an in-process engine that records every native call.

#![allow(dead_code)]

use llm_runloop::config::RunLoopConfig;
use llm_runloop::error::{AllocStage, EngineError, Result};
use llm_runloop::native::{EngineAbi, RawHandle};
use llm_runloop::{RunLoop, RunLoopClient};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Prompt marker that makes `completion_init` panic.
pub const PANIC_INIT: &str = "PANIC_INIT";
/// Prompt marker that makes `completion_step` panic.
pub const PANIC_STEP: &str = "PANIC_STEP";
/// Prompt marker that makes `completion_init` report an error.
pub const FAIL_INIT: &str = "FAIL_INIT";
/// Model path fragment that makes `load_model` panic.
pub const PANIC_MODEL: &str = "panic";

pub fn model_path() -> PathBuf {
    PathBuf::from("/models/tinyllama.Q4_0.gguf")
}

/// Behaviour of the mock engine. Tests may change it while the run loop runs.
#[derive(Debug, Clone)]
pub struct Script {
    /// Fragments produced, in order, before end of generation.
    pub fragments: Vec<String>,
    /// Never signal end of generation.
    pub endless: bool,
    /// Constructor that returns a null handle.
    pub fail: Option<AllocStage>,
    /// Cursor returned by `completion_init`.
    pub start_cursor: i32,
    /// Make `clear_cache` panic.
    pub panic_on_clear: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fragments: ["Hello", ",", " world", "!"].map(String::from).to_vec(),
            endless: false,
            fail: None,
            start_cursor: 0,
            panic_on_clear: false,
        }
    }
}

impl Script {
    pub fn endless() -> Self {
        Self {
            endless: true,
            ..Default::default()
        }
    }
}

/// Everything the mock engine observed.
#[derive(Debug, Default)]
pub struct Ledger {
    pub script: Script,
    next_handle: i64,
    /// Live allocations by raw handle.
    pub live: HashMap<i64, AllocStage>,
    /// Every handle ever allocated.
    pub allocated: Vec<i64>,
    /// Native call names in execution order.
    pub calls: Vec<&'static str>,
    /// Names of the threads native calls ran on.
    pub threads: BTreeSet<String>,
    pub log_hooks: usize,
    pub backend_inits: usize,
    pub backend_frees: usize,
    pub cache_clears: usize,
    /// `n_ctx` of every `new_context` call.
    pub context_sizes: Vec<u32>,
    /// `(text, format_chat)` of every `completion_init` call.
    pub prompts: Vec<(String, bool)>,
    /// Largest cursor value the engine produced.
    pub max_cursor: i32,
    /// Fragment index into the script for the running generation.
    position: usize,
}

impl Ledger {
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.prompts.last().map(|(text, _)| text.as_str())
    }
}

pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Scriptable stand-in for the native engine.
pub struct MockEngine {
    ledger: SharedLedger,
}

impl MockEngine {
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }

    fn record(&self, call: &'static str) -> parking_lot::MutexGuard<'_, Ledger> {
        let mut ledger = self.ledger.lock();
        ledger.calls.push(call);
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        ledger.threads.insert(thread);
        ledger
    }

    fn alloc(&self, call: &'static str, stage: AllocStage) -> Option<RawHandle> {
        let mut ledger = self.record(call);
        if ledger.script.fail == Some(stage) {
            return None;
        }
        ledger.next_handle += 1;
        let raw = 0x1000 + ledger.next_handle;
        ledger.live.insert(raw, stage);
        ledger.allocated.push(raw);
        RawHandle::from_raw(raw)
    }

    fn free(&self, call: &'static str, stage: AllocStage, handle: RawHandle) {
        let mut ledger = self.record(call);
        let freed = ledger.live.remove(&handle.as_raw());
        assert_eq!(freed, Some(stage), "{} of unknown or wrong handle {:?}", call, handle);
    }
}

impl EngineAbi for MockEngine {
    fn install_log_hook(&mut self) {
        self.record("log_set").log_hooks += 1;
    }

    fn backend_init(&mut self, _numa: bool) {
        self.record("backend_init").backend_inits += 1;
    }

    fn backend_free(&mut self) {
        self.record("backend_free").backend_frees += 1;
    }

    fn system_info(&mut self) -> String {
        self.record("system_info");
        "AVX = 1 | AVX2 = 1 | NEON = 0 | MOCK = 1".to_string()
    }

    fn load_model(&mut self, path: &Path) -> Option<RawHandle> {
        if path.to_string_lossy().contains(PANIC_MODEL) {
            drop(self.record("load_model"));
            panic!("mock model loader crashed");
        }
        self.alloc("load_model", AllocStage::Model)
    }

    fn free_model(&mut self, model: RawHandle) {
        self.free("free_model", AllocStage::Model, model)
    }

    fn new_context(&mut self, _model: RawHandle, n_ctx: u32) -> Option<RawHandle> {
        self.ledger.lock().context_sizes.push(n_ctx);
        self.alloc("new_context", AllocStage::Context)
    }

    fn free_context(&mut self, context: RawHandle) {
        self.free("free_context", AllocStage::Context, context)
    }

    fn new_batch(&mut self, _n_tokens: i32, _embd: i32, _n_seq_max: i32) -> Option<RawHandle> {
        self.alloc("new_batch", AllocStage::Batch)
    }

    fn free_batch(&mut self, batch: RawHandle) {
        self.free("free_batch", AllocStage::Batch, batch)
    }

    fn new_sampler(&mut self) -> Option<RawHandle> {
        self.alloc("new_sampler", AllocStage::Sampler)
    }

    fn free_sampler(&mut self, sampler: RawHandle) {
        self.free("free_sampler", AllocStage::Sampler, sampler)
    }

    fn completion_init(
        &mut self,
        context: RawHandle,
        _batch: RawHandle,
        text: &str,
        format_chat: bool,
        _n_len: i32,
    ) -> Result<i32> {
        let mut ledger = self.record("completion_init");
        assert!(ledger.live.contains_key(&context.as_raw()), "stale context");
        ledger.prompts.push((text.to_string(), format_chat));
        ledger.position = 0;
        if text.contains(PANIC_INIT) {
            drop(ledger);
            panic!("mock decode crashed");
        }
        if text.contains(FAIL_INIT) {
            return Err(EngineError::fault("completion_init() failed with code -1"));
        }
        Ok(ledger.script.start_cursor)
    }

    fn completion_step(
        &mut self,
        _context: RawHandle,
        _batch: RawHandle,
        _sampler: RawHandle,
        _n_len: i32,
        cursor: &mut i32,
    ) -> Option<String> {
        let mut ledger = self.record("completion_step");
        let panics = ledger
            .last_prompt()
            .map(|text| text.contains(PANIC_STEP))
            .unwrap_or(false);
        if panics && ledger.position > 0 {
            drop(ledger);
            panic!("mock sampler crashed");
        }

        let fragment = if ledger.script.endless {
            Some(format!("t{}", ledger.position))
        } else {
            ledger.script.fragments.get(ledger.position).cloned()
        };
        if fragment.is_some() {
            ledger.position += 1;
            *cursor += 1;
            ledger.max_cursor = ledger.max_cursor.max(*cursor);
        }
        fragment
    }

    fn clear_cache(&mut self, _context: RawHandle) {
        let mut ledger = self.record("kv_cache_clear");
        if ledger.script.panic_on_clear {
            drop(ledger);
            panic!("mock cache clear crashed");
        }
        ledger.cache_clears += 1;
    }

    fn bench(
        &mut self,
        _context: RawHandle,
        _model: RawHandle,
        _batch: RawHandle,
        pp: i32,
        tg: i32,
        pl: i32,
        nr: i32,
    ) -> Result<String> {
        self.record("bench_model");
        Ok(format!(
            "| model | size | params | backend | test | t/s |\n| mock | 1 MiB | 1 M | CPU | pp {} tg {} pl {} | {} reps |",
            pp, tg, pl, nr
        ))
    }
}

/// Start a run loop over a [`MockEngine`] with default configuration.
pub async fn start(script: Script) -> (RunLoopClient, SharedLedger) {
    start_with_config(RunLoopConfig::default(), script)
        .await
        .expect("test: run loop should start")
}

pub async fn start_with_config(
    config: RunLoopConfig,
    script: Script,
) -> Result<(RunLoopClient, SharedLedger)> {
    let ledger: SharedLedger = Arc::new(Mutex::new(Ledger {
        script,
        ..Default::default()
    }));
    let engine_ledger = ledger.clone();
    let client = RunLoop::start_with(config, move || {
        Ok(Box::new(MockEngine::new(engine_ledger)) as Box<dyn EngineAbi>)
    })
    .await?;
    Ok((client, ledger))
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
