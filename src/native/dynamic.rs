//! Runtime binding of the llama.cpp shim library.
//!
//! The shim exports a flat C ABI over llama.cpp; handles travel as `int64_t`
//! with zero meaning null:
//!
//! ```c
//! void     llama_runloop_log_set(void (*cb)(int level, const char *text, void *ud), void *ud);
//! void     llama_runloop_backend_init(bool numa);
//! void     llama_runloop_backend_free(void);
//! const char *llama_runloop_system_info(void);
//! int64_t  llama_runloop_load_model(const char *path);
//! void     llama_runloop_free_model(int64_t model);
//! int64_t  llama_runloop_new_context(int64_t model, int32_t n_ctx);
//! void     llama_runloop_free_context(int64_t context);
//! int64_t  llama_runloop_new_batch(int32_t n_tokens, int32_t embd, int32_t n_seq_max);
//! void     llama_runloop_free_batch(int64_t batch);
//! int64_t  llama_runloop_new_sampler(void);
//! void     llama_runloop_free_sampler(int64_t sampler);
//! int32_t  llama_runloop_completion_init(int64_t ctx, int64_t batch, const char *text,
//!                                        bool format_chat, int32_t n_len);   /* < 0 on error */
//! char    *llama_runloop_completion_loop(int64_t ctx, int64_t batch, int64_t sampler,
//!                                        int32_t n_len, int32_t *n_cur);     /* NULL at end */
//! void     llama_runloop_kv_cache_clear(int64_t ctx);
//! char    *llama_runloop_bench_model(int64_t ctx, int64_t model, int64_t batch,
//!                                    int32_t pp, int32_t tg, int32_t pl, int32_t nr);
//! void     llama_runloop_string_free(char *s);
//! ```

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

use libloading::Library;
use tracing::{debug, error, info, trace, warn};

use super::{EngineAbi, RawHandle};
use crate::error::{EngineError, Result};

type LogCallbackFn = unsafe extern "C" fn(c_int, *const c_char, *mut c_void);
type LogSetFn = unsafe extern "C" fn(Option<LogCallbackFn>, *mut c_void);
type BackendInitFn = unsafe extern "C" fn(bool);
type BackendFreeFn = unsafe extern "C" fn();
type SystemInfoFn = unsafe extern "C" fn() -> *const c_char;
type LoadModelFn = unsafe extern "C" fn(*const c_char) -> i64;
type FreeHandleFn = unsafe extern "C" fn(i64);
type NewContextFn = unsafe extern "C" fn(i64, i32) -> i64;
type NewBatchFn = unsafe extern "C" fn(i32, i32, i32) -> i64;
type NewSamplerFn = unsafe extern "C" fn() -> i64;
type CompletionInitFn = unsafe extern "C" fn(i64, i64, *const c_char, bool, i32) -> i32;
type CompletionLoopFn = unsafe extern "C" fn(i64, i64, i64, i32, *mut i32) -> *mut c_char;
type KvCacheClearFn = unsafe extern "C" fn(i64);
type BenchModelFn = unsafe extern "C" fn(i64, i64, i64, i32, i32, i32, i32) -> *mut c_char;
type StringFreeFn = unsafe extern "C" fn(*mut c_char);

// ggml_log_level values
const LOG_LEVEL_DEBUG: c_int = 1;
const LOG_LEVEL_INFO: c_int = 2;
const LOG_LEVEL_WARN: c_int = 3;
const LOG_LEVEL_ERROR: c_int = 4;

/// llama.cpp shim opened with `dlopen`.
pub struct DynamicEngine {
    #[allow(dead_code)]
    lib: Library,

    log_set: LogSetFn,
    backend_init: BackendInitFn,
    backend_free: BackendFreeFn,
    system_info: SystemInfoFn,

    load_model: LoadModelFn,
    free_model: FreeHandleFn,
    new_context: NewContextFn,
    free_context: FreeHandleFn,
    new_batch: NewBatchFn,
    free_batch: FreeHandleFn,
    new_sampler: NewSamplerFn,
    free_sampler: FreeHandleFn,

    completion_init: CompletionInitFn,
    completion_loop: CompletionLoopFn,
    kv_cache_clear: KvCacheClearFn,
    bench_model: BenchModelFn,
    string_free: StringFreeFn,
}

/// Copy a symbol out of the library. The caller keeps `lib` alive for as
/// long as the returned function pointer is used.
unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    let sym = lib.get::<T>(name).map_err(|e| {
        let printable = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
        EngineError::Library(format!("{}: {}", printable, e))
    })?;
    Ok(*sym)
}

impl DynamicEngine {
    /// Open the shim library and bind every entry point.
    pub fn open(path: &Path) -> Result<Self> {
        debug!("Opening native library {}", path.display());
        let lib = unsafe { Library::new(path) }?;

        unsafe {
            Ok(Self {
                log_set: symbol(&lib, b"llama_runloop_log_set\0")?,
                backend_init: symbol(&lib, b"llama_runloop_backend_init\0")?,
                backend_free: symbol(&lib, b"llama_runloop_backend_free\0")?,
                system_info: symbol(&lib, b"llama_runloop_system_info\0")?,
                load_model: symbol(&lib, b"llama_runloop_load_model\0")?,
                free_model: symbol(&lib, b"llama_runloop_free_model\0")?,
                new_context: symbol(&lib, b"llama_runloop_new_context\0")?,
                free_context: symbol(&lib, b"llama_runloop_free_context\0")?,
                new_batch: symbol(&lib, b"llama_runloop_new_batch\0")?,
                free_batch: symbol(&lib, b"llama_runloop_free_batch\0")?,
                new_sampler: symbol(&lib, b"llama_runloop_new_sampler\0")?,
                free_sampler: symbol(&lib, b"llama_runloop_free_sampler\0")?,
                completion_init: symbol(&lib, b"llama_runloop_completion_init\0")?,
                completion_loop: symbol(&lib, b"llama_runloop_completion_loop\0")?,
                kv_cache_clear: symbol(&lib, b"llama_runloop_kv_cache_clear\0")?,
                bench_model: symbol(&lib, b"llama_runloop_bench_model\0")?,
                string_free: symbol(&lib, b"llama_runloop_string_free\0")?,
                lib,
            })
        }
    }

    /// Take ownership of a heap string returned by the shim.
    fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { (self.string_free)(ptr) };
        Some(text)
    }
}

unsafe extern "C" fn forward_native_log(level: c_int, text: *const c_char, _user: *mut c_void) {
    if text.is_null() {
        return;
    }
    let text = CStr::from_ptr(text).to_string_lossy();
    let line = text.trim_end();
    if line.is_empty() {
        return;
    }
    match level {
        LOG_LEVEL_ERROR => error!(target: "llm_runloop::native", "{}", line),
        LOG_LEVEL_WARN => warn!(target: "llm_runloop::native", "{}", line),
        LOG_LEVEL_INFO => info!(target: "llm_runloop::native", "{}", line),
        LOG_LEVEL_DEBUG => debug!(target: "llm_runloop::native", "{}", line),
        _ => trace!(target: "llm_runloop::native", "{}", line),
    }
}

impl EngineAbi for DynamicEngine {
    fn install_log_hook(&mut self) {
        unsafe { (self.log_set)(Some(forward_native_log), std::ptr::null_mut()) };
    }

    fn backend_init(&mut self, numa: bool) {
        unsafe { (self.backend_init)(numa) };
    }

    fn backend_free(&mut self) {
        unsafe { (self.backend_free)() };
    }

    fn system_info(&mut self) -> String {
        let ptr = unsafe { (self.system_info)() };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn load_model(&mut self, path: &Path) -> Option<RawHandle> {
        let c_path = match CString::new(path.as_os_str().as_encoded_bytes()) {
            Ok(c_path) => c_path,
            Err(_) => {
                warn!("Model path contains an interior NUL: {}", path.display());
                return None;
            }
        };
        RawHandle::from_raw(unsafe { (self.load_model)(c_path.as_ptr()) })
    }

    fn free_model(&mut self, model: RawHandle) {
        unsafe { (self.free_model)(model.as_raw()) };
    }

    fn new_context(&mut self, model: RawHandle, n_ctx: u32) -> Option<RawHandle> {
        RawHandle::from_raw(unsafe { (self.new_context)(model.as_raw(), n_ctx as i32) })
    }

    fn free_context(&mut self, context: RawHandle) {
        unsafe { (self.free_context)(context.as_raw()) };
    }

    fn new_batch(&mut self, n_tokens: i32, embd: i32, n_seq_max: i32) -> Option<RawHandle> {
        RawHandle::from_raw(unsafe { (self.new_batch)(n_tokens, embd, n_seq_max) })
    }

    fn free_batch(&mut self, batch: RawHandle) {
        unsafe { (self.free_batch)(batch.as_raw()) };
    }

    fn new_sampler(&mut self) -> Option<RawHandle> {
        RawHandle::from_raw(unsafe { (self.new_sampler)() })
    }

    fn free_sampler(&mut self, sampler: RawHandle) {
        unsafe { (self.free_sampler)(sampler.as_raw()) };
    }

    fn completion_init(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        text: &str,
        format_chat: bool,
        n_len: i32,
    ) -> Result<i32> {
        let c_text = CString::new(text)
            .map_err(|_| EngineError::config("prompt contains an interior NUL byte"))?;
        let cursor = unsafe {
            (self.completion_init)(
                context.as_raw(),
                batch.as_raw(),
                c_text.as_ptr(),
                format_chat,
                n_len,
            )
        };
        if cursor < 0 {
            return Err(EngineError::fault(format!(
                "completion_init() failed with code {}",
                cursor
            )));
        }
        Ok(cursor)
    }

    fn completion_step(
        &mut self,
        context: RawHandle,
        batch: RawHandle,
        sampler: RawHandle,
        n_len: i32,
        cursor: &mut i32,
    ) -> Option<String> {
        let ptr = unsafe {
            (self.completion_loop)(
                context.as_raw(),
                batch.as_raw(),
                sampler.as_raw(),
                n_len,
                cursor as *mut i32,
            )
        };
        self.take_string(ptr)
    }

    fn clear_cache(&mut self, context: RawHandle) {
        unsafe { (self.kv_cache_clear)(context.as_raw()) };
    }

    fn bench(
        &mut self,
        context: RawHandle,
        model: RawHandle,
        batch: RawHandle,
        pp: i32,
        tg: i32,
        pl: i32,
        nr: i32,
    ) -> Result<String> {
        let ptr = unsafe {
            (self.bench_model)(
                context.as_raw(),
                model.as_raw(),
                batch.as_raw(),
                pp,
                tg,
                pl,
                nr,
            )
        };
        self.take_string(ptr)
            .ok_or_else(|| EngineError::fault("bench_model() returned null"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library() {
        let err = DynamicEngine::open(Path::new("/nonexistent/libllama-runloop.so"))
            .err()
            .expect("opening a missing library must fail");
        assert!(matches!(err, EngineError::Library(_)));
        assert!(err.is_fatal());
    }
}
