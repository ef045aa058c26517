//! Ownership guards for native engine allocations.
//!
//! A [`Handle`] can only be created from a non-null constructor result and is
//! neither `Copy` nor `Clone`; releasing it consumes it, so a freed handle
//! cannot be used again. [`EngineHandles`] groups the four allocations of a
//! loaded engine: they are acquired together by [`EngineHandles::allocate`]
//! and released together by [`EngineHandles::release`].

use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::{BatchConfig, ContextSize};
use crate::error::{AllocStage, EngineError, Result};
use crate::native::{EngineAbi, RawHandle};

/// Kind of native allocation a [`Handle`] refers to.
pub trait HandleKind {
    const STAGE: AllocStage;

    /// Free the allocation. Called exactly once per handle.
    fn free(abi: &mut dyn EngineAbi, raw: RawHandle);
}

#[derive(Debug)]
pub enum Model {}
#[derive(Debug)]
pub enum Context {}
#[derive(Debug)]
pub enum Batch {}
#[derive(Debug)]
pub enum Sampler {}

impl HandleKind for Model {
    const STAGE: AllocStage = AllocStage::Model;

    fn free(abi: &mut dyn EngineAbi, raw: RawHandle) {
        abi.free_model(raw);
    }
}

impl HandleKind for Context {
    const STAGE: AllocStage = AllocStage::Context;

    fn free(abi: &mut dyn EngineAbi, raw: RawHandle) {
        abi.free_context(raw);
    }
}

impl HandleKind for Batch {
    const STAGE: AllocStage = AllocStage::Batch;

    fn free(abi: &mut dyn EngineAbi, raw: RawHandle) {
        abi.free_batch(raw);
    }
}

impl HandleKind for Sampler {
    const STAGE: AllocStage = AllocStage::Sampler;

    fn free(abi: &mut dyn EngineAbi, raw: RawHandle) {
        abi.free_sampler(raw);
    }
}

/// Single native allocation of kind `K`.
#[must_use = "native handles must be released through the engine"]
pub struct Handle<K: HandleKind> {
    raw: RawHandle,
    _kind: PhantomData<K>,
}

impl<K: HandleKind> Handle<K> {
    /// Take ownership of a constructor result, failing on null.
    pub fn acquire(raw: Option<RawHandle>) -> Result<Self> {
        raw.map(|raw| Self {
            raw,
            _kind: PhantomData,
        })
        .ok_or(EngineError::AllocationFailed(K::STAGE))
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn release(self, abi: &mut dyn EngineAbi) {
        K::free(abi, self.raw);
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", K::STAGE, self.raw)
    }
}

/// The four allocations that make up a loaded engine.
#[derive(Debug)]
#[must_use = "native handles must be released through the engine"]
pub struct EngineHandles {
    model: Handle<Model>,
    context: Handle<Context>,
    batch: Handle<Batch>,
    sampler: Handle<Sampler>,
}

impl EngineHandles {
    /// Allocate model, context, batch and sampler in that order.
    ///
    /// If any constructor returns null, the handles already allocated by this
    /// call are freed, newest first, before the error is returned.
    pub fn allocate(
        abi: &mut dyn EngineAbi,
        path: &Path,
        context_size: ContextSize,
        batch: BatchConfig,
    ) -> Result<Self> {
        let model = Handle::<Model>::acquire(abi.load_model(path))?;

        let context = match Handle::<Context>::acquire(
            abi.new_context(model.raw(), context_size.get()),
        ) {
            Ok(context) => context,
            Err(e) => {
                warn!("{}, releasing model", e);
                model.release(abi);
                return Err(e);
            }
        };

        let batch = match Handle::<Batch>::acquire(abi.new_batch(
            batch.tokens,
            batch.embd,
            batch.seqs,
        )) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("{}, releasing context and model", e);
                context.release(abi);
                model.release(abi);
                return Err(e);
            }
        };

        let sampler = match Handle::<Sampler>::acquire(abi.new_sampler()) {
            Ok(sampler) => sampler,
            Err(e) => {
                warn!("{}, releasing batch, context and model", e);
                batch.release(abi);
                context.release(abi);
                model.release(abi);
                return Err(e);
            }
        };

        Ok(Self {
            model,
            context,
            batch,
            sampler,
        })
    }

    pub fn model(&self) -> RawHandle {
        self.model.raw()
    }

    pub fn context(&self) -> RawHandle {
        self.context.raw()
    }

    pub fn batch(&self) -> RawHandle {
        self.batch.raw()
    }

    pub fn sampler(&self) -> RawHandle {
        self.sampler.raw()
    }

    /// Free all four allocations. The context goes before the model it was
    /// created from.
    pub fn release(self, abi: &mut dyn EngineAbi) {
        debug!(handles = ?self, "Releasing engine handles");
        self.context.release(abi);
        self.model.release(abi);
        self.batch.release(abi);
        self.sampler.release(abi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Allocates sequential handles; constructors listed in `fail` return null.
    #[derive(Default)]
    struct CountingAbi {
        next: i64,
        live: HashSet<i64>,
        fail: Option<AllocStage>,
        freed: Vec<AllocStage>,
    }

    impl CountingAbi {
        fn alloc(&mut self, stage: AllocStage) -> Option<RawHandle> {
            if self.fail == Some(stage) {
                return None;
            }
            self.next += 1;
            self.live.insert(self.next);
            RawHandle::from_raw(self.next)
        }

        fn free(&mut self, stage: AllocStage, raw: RawHandle) {
            assert!(self.live.remove(&raw.as_raw()), "double free of {:?}", raw);
            self.freed.push(stage);
        }
    }

    impl EngineAbi for CountingAbi {
        fn install_log_hook(&mut self) {}
        fn backend_init(&mut self, _numa: bool) {}
        fn backend_free(&mut self) {}
        fn system_info(&mut self) -> String {
            String::new()
        }
        fn load_model(&mut self, _path: &Path) -> Option<RawHandle> {
            self.alloc(AllocStage::Model)
        }
        fn free_model(&mut self, model: RawHandle) {
            self.free(AllocStage::Model, model)
        }
        fn new_context(&mut self, _model: RawHandle, _n_ctx: u32) -> Option<RawHandle> {
            self.alloc(AllocStage::Context)
        }
        fn free_context(&mut self, context: RawHandle) {
            self.free(AllocStage::Context, context)
        }
        fn new_batch(&mut self, _n: i32, _e: i32, _s: i32) -> Option<RawHandle> {
            self.alloc(AllocStage::Batch)
        }
        fn free_batch(&mut self, batch: RawHandle) {
            self.free(AllocStage::Batch, batch)
        }
        fn new_sampler(&mut self) -> Option<RawHandle> {
            self.alloc(AllocStage::Sampler)
        }
        fn free_sampler(&mut self, sampler: RawHandle) {
            self.free(AllocStage::Sampler, sampler)
        }
        fn completion_init(
            &mut self,
            _context: RawHandle,
            _batch: RawHandle,
            _text: &str,
            _format_chat: bool,
            _n_len: i32,
        ) -> Result<i32> {
            Ok(0)
        }
        fn completion_step(
            &mut self,
            _context: RawHandle,
            _batch: RawHandle,
            _sampler: RawHandle,
            _n_len: i32,
            _cursor: &mut i32,
        ) -> Option<String> {
            None
        }
        fn clear_cache(&mut self, _context: RawHandle) {}
        fn bench(
            &mut self,
            _context: RawHandle,
            _model: RawHandle,
            _batch: RawHandle,
            _pp: i32,
            _tg: i32,
            _pl: i32,
            _nr: i32,
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    fn allocate(abi: &mut CountingAbi) -> Result<EngineHandles> {
        EngineHandles::allocate(
            abi,
            Path::new("model.gguf"),
            ContextSize::default(),
            BatchConfig::default(),
        )
    }

    #[test]
    fn test_null_handle_rejected() {
        let err = Handle::<Sampler>::acquire(None).unwrap_err();
        assert_eq!(err, EngineError::AllocationFailed(AllocStage::Sampler));
    }

    #[test]
    fn test_allocate_and_release() {
        let mut abi = CountingAbi::default();
        let handles = allocate(&mut abi).unwrap();
        assert_eq!(abi.live.len(), 4);
        assert_ne!(handles.model(), handles.context());

        handles.release(&mut abi);
        assert!(abi.live.is_empty());
        assert_eq!(
            abi.freed,
            vec![AllocStage::Context, AllocStage::Model, AllocStage::Batch, AllocStage::Sampler]
        );
    }

    #[test]
    fn test_failed_stage_rolls_back_earlier_handles() {
        for stage in [
            AllocStage::Model,
            AllocStage::Context,
            AllocStage::Batch,
            AllocStage::Sampler,
        ] {
            let mut abi = CountingAbi {
                fail: Some(stage),
                ..Default::default()
            };
            let err = allocate(&mut abi).unwrap_err();
            assert_eq!(err, EngineError::AllocationFailed(stage));
            assert!(abi.live.is_empty(), "leaked handles after {:?} failure", stage);
        }
    }

    #[test]
    fn test_rollback_order_is_newest_first() {
        let mut abi = CountingAbi {
            fail: Some(AllocStage::Sampler),
            ..Default::default()
        };
        allocate(&mut abi).unwrap_err();
        assert_eq!(
            abi.freed,
            vec![AllocStage::Batch, AllocStage::Context, AllocStage::Model]
        );
    }
}
