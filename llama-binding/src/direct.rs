//! Direct binding: the bridge backend loaded as a shared library.
//!
//! Load order is every platform dependency (in declared order), then the
//! bridge library, then symbol resolution into [`BridgeFunctions`]. The
//! loaded set sits behind an `Arc` so a call running on the blocking pool
//! keeps the libraries mapped even if [`DirectBinding::free`] runs
//! concurrently; the actual unload happens when the last call finishes.

use crate::backend::{BindingState, InferenceBackend};
use crate::error::{BindingError, MarshalError, Result};
use crate::ffi::{BridgeFunctions, EmbeddingParams, GenerationParams, InitParams};
use crate::layout::{Abi, PointerAllocator};
use crate::marshal::{
    pack_embedding_params, pack_generation_params, pack_init_params, split_messages,
    validate_embeddings, CallArena, MessageBuffers,
};
use crate::platform::PlatformKey;
use common::logging::forward_native;
use common::{
    invoke_guarded, Completion, EmbeddingParameters, GenerationConfig, InitializationParameters,
    LogLevel, LogSink, MessageSequence, SequenceLimits, TokenCallback, TracingSink,
};
use libloading::Library;
use parking_lot::{const_rwlock, Condvar, Mutex, RwLock};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where to find the native libraries.
#[derive(Clone)]
pub struct DirectConfig {
    /// Root holding one folder per platform key
    pub library_dir: PathBuf,
    /// Override for the detected platform
    pub platform: Option<PlatformKey>,
    /// Install the backend log hook at load time
    pub native_logging: bool,
    /// Receives backend log lines while the hook is installed
    pub log_sink: Arc<dyn LogSink>,
}

impl DirectConfig {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
            platform: None,
            native_logging: false,
            log_sink: Arc::new(TracingSink),
        }
    }
}

impl std::fmt::Debug for DirectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectConfig")
            .field("library_dir", &self.library_dir)
            .field("platform", &self.platform)
            .field("native_logging", &self.native_logging)
            .finish_non_exhaustive()
    }
}

/// Sink read by [`log_trampoline`]. The backend's log hook carries no user
/// data, so the most recently loaded binding's sink wins.
static NATIVE_LOG_SINK: RwLock<Option<Arc<dyn LogSink>>> = const_rwlock(None);

fn install_log_sink(sink: &Arc<dyn LogSink>) {
    *NATIVE_LOG_SINK.write() = Some(sink.clone());
}

fn uninstall_log_sink(sink: &Arc<dyn LogSink>) {
    let mut installed = NATIVE_LOG_SINK.write();
    if installed.as_ref().is_some_and(|current| Arc::ptr_eq(current, sink)) {
        *installed = None;
    }
}

/// Loaded libraries, released main-first then dependencies in reverse.
struct LibrarySet {
    main: Option<Library>,
    dependencies: Vec<Library>,
}

impl Drop for LibrarySet {
    fn drop(&mut self) {
        drop(self.main.take());
        while let Some(library) = self.dependencies.pop() {
            drop(library);
        }
    }
}

struct LoadedBackend {
    functions: BridgeFunctions,
    _libraries: LibrarySet,
}

enum LoadSlot {
    Unloaded,
    Loading,
    Loaded(Arc<LoadedBackend>),
    Freed,
}

pub struct DirectBinding {
    config: DirectConfig,
    slot: Mutex<LoadSlot>,
    load_finished: Condvar,
}

impl DirectBinding {
    pub fn new(config: DirectConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(LoadSlot::Unloaded),
            load_finished: Condvar::new(),
        }
    }

    /// Binding over an already-resolved function table (statically linked
    /// backends and in-process fakes). Starts out loaded.
    pub fn from_functions(functions: BridgeFunctions, native_logging: bool) -> Self {
        let config = DirectConfig {
            native_logging,
            ..DirectConfig::new(PathBuf::new())
        };
        if native_logging {
            install_log_sink(&config.log_sink);
            // SAFETY: the table's contract is that of a loaded backend.
            unsafe { (functions.set_log_callback)(Some(log_trampoline)) };
        }
        Self {
            config,
            slot: Mutex::new(LoadSlot::Loaded(Arc::new(LoadedBackend {
                functions,
                _libraries: LibrarySet {
                    main: None,
                    dependencies: Vec::new(),
                },
            }))),
            load_finished: Condvar::new(),
        }
    }

    /// Replace the log sink. With native logging on, lines the backend
    /// emits from now on go to `sink`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        if self.config.native_logging {
            uninstall_log_sink(&self.config.log_sink);
            if self.is_loaded() {
                install_log_sink(&sink);
            }
        }
        self.config.log_sink = sink;
        self
    }

    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    fn load_libraries(&self) -> Result<LoadedBackend> {
        let platform = match self.config.platform {
            Some(platform) => platform,
            None => PlatformKey::current()?,
        };
        let root = &self.config.library_dir;
        info!("Loading bridge backend for {} from {}", platform, root.display());

        let mut libraries = LibrarySet {
            main: None,
            dependencies: Vec::new(),
        };
        for path in platform.dependency_paths(root) {
            libraries.dependencies.push(open_library(&path)?);
        }
        let main = libraries.main.insert(open_library(&platform.main_library_path(root))?);

        // SAFETY: the main library is the bridge backend for this platform;
        // the resolved pointers are stored next to the library that owns them.
        let functions = unsafe { BridgeFunctions::load(main)? };

        if self.config.native_logging {
            install_log_sink(&self.config.log_sink);
            // SAFETY: set_log_callback was resolved from the live library.
            unsafe { (functions.set_log_callback)(Some(log_trampoline)) };
        }

        info!(
            "Bridge backend loaded ({} dependencies)",
            libraries.dependencies.len()
        );
        Ok(LoadedBackend {
            functions,
            _libraries: libraries,
        })
    }

    /// Loaded backend for `op`, loading on first use.
    fn acquire(&self, op: &str) -> Option<Arc<LoadedBackend>> {
        if let Err(e) = self.ensure_loaded() {
            warn!("{}: backend unavailable: {}", op, e);
            return None;
        }
        match &*self.slot.lock() {
            LoadSlot::Loaded(backend) => Some(backend.clone()),
            _ => {
                warn!("{}: backend freed before the call", op);
                None
            }
        }
    }

    /// Marshal and call synchronously, completing with `false` on any failure.
    fn call_bool<F>(&self, op: &'static str, done: Completion<bool>, call: F)
    where
        F: FnOnce(&BridgeFunctions, &mut CallArena) -> std::result::Result<bool, MarshalError>,
    {
        let ok = match self.acquire(op) {
            Some(backend) => {
                let mut arena = CallArena::new();
                marshal_outcome(op, call(&backend.functions, &mut arena))
            }
            None => false,
        };
        complete(op, done, ok);
    }
}

fn open_library(path: &Path) -> Result<Library> {
    if !path.exists() {
        return Err(BindingError::LibraryNotFound(path.to_path_buf()));
    }
    debug!("Loading library {}", path.display());
    // SAFETY: loading a library runs its initializers; these are the
    // backend's own libraries from the configured folder.
    unsafe { Library::new(path) }.map_err(|e| BindingError::BrokenDependencyChain {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn marshal_outcome(op: &str, result: std::result::Result<bool, MarshalError>) -> bool {
    match result {
        Ok(ok) => {
            if !ok {
                debug!("{}: backend reported failure", op);
            }
            ok
        }
        Err(e) => {
            error!("{}: {}", op, e);
            false
        }
    }
}

fn complete<T>(op: &str, done: Completion<T>, value: T) {
    invoke_guarded(op, move || done(value));
}

/// Run a blocking native call off the caller's thread.
fn spawn_blocking<F>(op: &'static str, job: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            if let Err(e) = std::thread::Builder::new()
                .name(format!("llmbridge-{}", op))
                .spawn(job)
            {
                error!("{}: could not start background thread: {}", op, e);
            }
        }
    }
}

extern "C" fn log_trampoline(level: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: the backend passes a NUL-terminated string valid for the call.
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    let sink = NATIVE_LOG_SINK.read().clone();
    let _ = catch_unwind(AssertUnwindSafe(|| match sink {
        Some(sink) => sink.log(LogLevel::from(level), &text),
        None => forward_native(LogLevel::from(level), &text),
    }));
}

extern "C" fn token_trampoline(user_data: *mut c_void, token: *const c_char) {
    if user_data.is_null() || token.is_null() {
        return;
    }
    // SAFETY: user_data is the `&TokenCallback` handed to generate_response,
    // borrowed for the whole (blocking) call.
    let callback = unsafe { &*(user_data as *const TokenCallback) };
    // SAFETY: the backend passes a NUL-terminated string valid for the call.
    let text = unsafe { CStr::from_ptr(token) }.to_string_lossy();
    if catch_unwind(AssertUnwindSafe(|| callback.as_ref()(&*text))).is_err() {
        error!("Token callback panicked; token dropped");
    }
}

fn read_float_output(op: &str, mut out: Vec<f32>, written: c_int) -> Option<Vec<f32>> {
    let Ok(written) = usize::try_from(written) else {
        debug!("{}: backend reported failure ({})", op, written);
        return None;
    };
    if written == 0 || written > out.len() {
        warn!(
            "{}: backend wrote {} values into a buffer of {}",
            op,
            written,
            out.len()
        );
        return None;
    }
    out.truncate(written);
    Some(out)
}

impl InferenceBackend for DirectBinding {
    fn ensure_loaded(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        loop {
            match &*slot {
                LoadSlot::Loaded(_) => return Ok(()),
                LoadSlot::Freed => return Err(BindingError::Freed),
                LoadSlot::Loading => self.load_finished.wait(&mut slot),
                LoadSlot::Unloaded => break,
            }
        }
        *slot = LoadSlot::Loading;
        drop(slot);

        let result = self.load_libraries();

        let mut slot = self.slot.lock();
        let outcome = match (result, &*slot) {
            (Ok(_), LoadSlot::Freed) => Err(BindingError::Freed),
            (Ok(backend), _) => {
                *slot = LoadSlot::Loaded(Arc::new(backend));
                Ok(())
            }
            (Err(e), LoadSlot::Freed) => Err(e),
            (Err(e), _) => {
                error!("Bridge backend failed to load: {}", e);
                *slot = LoadSlot::Unloaded;
                Err(e)
            }
        };
        self.load_finished.notify_all();
        outcome
    }

    fn state(&self) -> BindingState {
        match &*self.slot.lock() {
            LoadSlot::Unloaded => BindingState::Unloaded,
            LoadSlot::Loading => BindingState::Loading,
            LoadSlot::Loaded(_) => BindingState::Loaded,
            LoadSlot::Freed => BindingState::Freed,
        }
    }

    fn free(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), LoadSlot::Freed);
        if let LoadSlot::Loaded(backend) = previous {
            if self.config.native_logging {
                // SAFETY: the library is still mapped; we hold a reference.
                unsafe { (backend.functions.set_log_callback)(None) };
                uninstall_log_sink(&self.config.log_sink);
            }
            if Arc::strong_count(&backend) > 1 {
                debug!("Backend still in use; unloading after in-flight calls finish");
            }
            info!("Bridge backend freed");
        }
        self.load_finished.notify_all();
    }

    fn dispose(&self, model_ids: &[String]) {
        let backend = match &*self.slot.lock() {
            LoadSlot::Loaded(backend) => Some(backend.clone()),
            _ => None,
        };
        if let Some(backend) = backend {
            for model_id in model_ids {
                let mut arena = CallArena::new();
                let ok = marshal_outcome(
                    "shutdown_model",
                    arena
                        .cstr(model_id)
                        // SAFETY: valid NUL-terminated id owned by the arena.
                        .map(|id| unsafe { (backend.functions.shutdown_model)(id) }),
                );
                info!("Shut down model '{}' during dispose: {}", model_id, ok);
            }
        }
        self.free();
    }

    fn initialize_model(
        &self,
        model_id: &str,
        params: &InitializationParameters,
        done: Completion<bool>,
    ) {
        const OP: &str = "initialize_model";
        let Some(backend) = self.acquire(OP) else {
            return complete(OP, done, false);
        };
        if let Err(e) = params.validate() {
            error!("{}: {}", OP, e);
            return complete(OP, done, false);
        }

        let model_id = model_id.to_string();
        let params = params.clone();
        spawn_blocking(OP, move || {
            let mut arena = CallArena::new();
            let result = (|| {
                let id = arena.cstr(&model_id)?;
                let packed = pack_init_params(&params, &mut arena)?;
                // SAFETY: id and the packed InitParams live in the arena
                // and `packed` until the call returns.
                Ok::<_, MarshalError>(unsafe {
                    (backend.functions.initialize_model)(id, packed.as_native_ptr::<InitParams>())
                })
            })();
            let ok = marshal_outcome(OP, result);
            drop(arena);
            info!("Model '{}' initialized: {}", model_id, ok);
            complete(OP, done, ok);
        });
    }

    fn shutdown_model(&self, model_id: &str, done: Completion<bool>) {
        const OP: &str = "shutdown_model";
        let Some(backend) = self.acquire(OP) else {
            return complete(OP, done, false);
        };
        let model_id = model_id.to_string();
        spawn_blocking(OP, move || {
            let mut arena = CallArena::new();
            let result = arena
                .cstr(&model_id)
                // SAFETY: valid NUL-terminated id owned by the arena.
                .map(|id| unsafe { (backend.functions.shutdown_model)(id) });
            complete(OP, done, marshal_outcome(OP, result));
        });
    }

    fn abort_initialize_model(&self, model_id: &str) {
        const OP: &str = "abort_initialize_model";
        let Some(backend) = self.acquire(OP) else {
            return;
        };
        let mut arena = CallArena::new();
        match arena.cstr(model_id) {
            // SAFETY: valid NUL-terminated id owned by the arena.
            Ok(id) => unsafe { (backend.functions.abort_initialize_model)(id) },
            Err(e) => error!("{}: {}", OP, e),
        }
    }

    fn init_context(
        &self,
        model_id: &str,
        key: &str,
        messages: &MessageSequence,
        done: Completion<bool>,
    ) {
        self.call_bool("init_context", done, |f, arena| {
            let id = arena.cstr(model_id)?;
            let key = arena.cstr(key)?;
            let (roles, contents) = split_messages(messages);
            let count = i32::try_from(roles.len())
                .map_err(|_| MarshalError::ArrayTooLong { len: roles.len() })?;
            let roles = arena.alloc_str_array(&roles)?;
            let contents = arena.alloc_str_array(&contents)?;
            // SAFETY: all pointers are owned by the arena; the arrays hold
            // `count` string pointers each (null when empty).
            Ok(unsafe {
                (f.init_context)(
                    id,
                    key,
                    roles as usize as *const *const c_char,
                    contents as usize as *const *const c_char,
                    count,
                )
            })
        });
    }

    fn get_context(
        &self,
        key: &str,
        limits: SequenceLimits,
        done: Completion<Option<MessageSequence>>,
    ) {
        const OP: &str = "get_context";
        let result = self.acquire(OP).and_then(|backend| {
            let mut arena = CallArena::new();
            let outcome = (|| {
                let key = arena.cstr(key)?;
                let mut buffers = MessageBuffers::new(limits)?;
                // Sizes were checked to fit in i32 by MessageBuffers::new
                let max_turns = limits.max_turn_count as c_int;
                let max_len = limits.max_string_length as c_int;
                // SAFETY: both columns are max_turns × max_len bytes.
                let count = unsafe {
                    (backend.functions.get_context)(
                        key,
                        buffers.roles.as_mut_ptr().cast::<c_char>(),
                        buffers.contents.as_mut_ptr().cast::<c_char>(),
                        max_turns,
                        max_len,
                    )
                };
                if count < 0 {
                    debug!("{}: backend reported failure ({})", OP, count);
                    return Ok(None);
                }
                buffers.read(count).map(Some)
            })();
            match outcome {
                Ok(messages) => messages,
                Err(e) => {
                    error!("{}: {}", OP, e);
                    None
                }
            }
        });
        complete(OP, done, result);
    }

    fn add_turn(&self, key: &str, role: &str, content: &str, done: Completion<bool>) {
        self.call_bool("add_turn_to_context", done, |f, arena| {
            let key = arena.cstr(key)?;
            let role = arena.cstr(role)?;
            let content = arena.cstr(content)?;
            // SAFETY: NUL-terminated strings owned by the arena.
            Ok(unsafe { (f.add_turn_to_context)(key, role, content) })
        });
    }

    fn append_to_context(&self, key: &str, content: &str, done: Completion<bool>) {
        self.call_bool("append_to_context", done, |f, arena| {
            let key = arena.cstr(key)?;
            let content = arena.cstr(content)?;
            // SAFETY: NUL-terminated strings owned by the arena.
            Ok(unsafe { (f.append_to_context)(key, content) })
        });
    }

    fn copy_context(&self, source_key: &str, destination_key: &str, done: Completion<bool>) {
        self.call_bool("copy_context", done, |f, arena| {
            let source = arena.cstr(source_key)?;
            let destination = arena.cstr(destination_key)?;
            // SAFETY: NUL-terminated strings owned by the arena.
            Ok(unsafe { (f.copy_context)(source, destination) })
        });
    }

    fn free_context(&self, key: &str, done: Completion<bool>) {
        self.call_bool("free_context", done, |f, arena| {
            let key = arena.cstr(key)?;
            // SAFETY: NUL-terminated string owned by the arena.
            Ok(unsafe { (f.free_context)(key) })
        });
    }

    fn unload_active_context(&self, model_id: &str, done: Completion<bool>) {
        self.call_bool("unload_active_context", done, |f, arena| {
            let id = arena.cstr(model_id)?;
            // SAFETY: NUL-terminated string owned by the arena.
            Ok(unsafe { (f.unload_active_context)(id) })
        });
    }

    fn cache_context(&self, key: &str, done: Completion<bool>) {
        self.call_bool("cache_context", done, |f, arena| {
            let key = arena.cstr(key)?;
            // SAFETY: NUL-terminated string owned by the arena.
            Ok(unsafe { (f.cache_context)(key) })
        });
    }

    fn load_context(&self, model_id: &str, key: &str, done: Completion<bool>) {
        self.call_bool("load_context", done, |f, arena| {
            let id = arena.cstr(model_id)?;
            let key = arena.cstr(key)?;
            // SAFETY: NUL-terminated strings owned by the arena.
            Ok(unsafe { (f.load_context)(id, key) })
        });
    }

    fn generate_response(
        &self,
        model_id: &str,
        input_key: &str,
        output_key: &str,
        config: &GenerationConfig,
        on_token: TokenCallback,
        done: Completion<bool>,
    ) {
        const OP: &str = "generate_response";
        let Some(backend) = self.acquire(OP) else {
            return complete(OP, done, false);
        };
        if let Err(e) = config.validate() {
            error!("{}: {}", OP, e);
            return complete(OP, done, false);
        }

        let model_id = model_id.to_string();
        let input_key = input_key.to_string();
        let output_key = output_key.to_string();
        let config = config.clone();
        spawn_blocking(OP, move || {
            let mut arena = CallArena::new();
            let result = (|| {
                let id = arena.cstr(&model_id)?;
                let input = arena.cstr(&input_key)?;
                let output = arena.cstr(&output_key)?;
                let packed = pack_generation_params(&config, &mut arena)?;
                let user_data = &on_token as *const TokenCallback as *mut c_void;
                // SAFETY: strings and params are owned by the arena and
                // `packed`; `on_token` outlives this blocking call.
                Ok::<_, MarshalError>(unsafe {
                    (backend.functions.generate_response)(
                        id,
                        input,
                        output,
                        packed.as_native_ptr::<GenerationParams>(),
                        token_trampoline,
                        user_data,
                    )
                })
            })();
            let ok = marshal_outcome(OP, result);
            drop(arena);
            complete(OP, done, ok);
        });
    }

    fn abort_generation(&self, model_id: &str) {
        const OP: &str = "abort_generation";
        let Some(backend) = self.acquire(OP) else {
            return;
        };
        let mut arena = CallArena::new();
        match arena.cstr(model_id) {
            // SAFETY: valid NUL-terminated id owned by the arena.
            Ok(id) => unsafe { (backend.functions.abort_generation)(id) },
            Err(e) => error!("{}: {}", OP, e),
        }
    }

    fn get_embeddings_size(&self, model_id: &str, done: Completion<Option<usize>>) {
        const OP: &str = "get_embeddings_size";
        let size = self.acquire(OP).and_then(|backend| {
            let mut arena = CallArena::new();
            match arena.cstr(model_id) {
                // SAFETY: valid NUL-terminated id owned by the arena.
                Ok(id) => usize::try_from(unsafe { (backend.functions.get_embeddings_size)(id) })
                    .ok(),
                Err(e) => {
                    error!("{}: {}", OP, e);
                    None
                }
            }
        });
        complete(OP, done, size);
    }

    fn compute_embeddings(
        &self,
        model_id: &str,
        text: &str,
        params: &EmbeddingParameters,
        done: Completion<Option<Vec<f32>>>,
    ) {
        const OP: &str = "compute_embeddings";
        let result = self.acquire(OP).and_then(|backend| {
            let mut arena = CallArena::new();
            let outcome = (|| {
                let id = arena.cstr(model_id)?;
                let text = arena.cstr(text)?;
                let packed = pack_embedding_params(params, Abi::Host)?;
                let capacity = params.max_embedding_size as usize;
                let capacity_arg = c_int::try_from(capacity)
                    .map_err(|_| MarshalError::ArrayTooLong { len: capacity })?;
                let mut out = vec![0f32; capacity];
                // SAFETY: `out` holds `capacity` floats; other pointers are
                // owned by the arena and `packed`.
                let written = unsafe {
                    (backend.functions.compute_embeddings)(
                        id,
                        text,
                        packed.as_native_ptr::<EmbeddingParams>(),
                        out.as_mut_ptr(),
                        capacity_arg,
                    )
                };
                Ok::<_, MarshalError>(read_float_output(OP, out, written))
            })();
            match outcome {
                Ok(values) => values.and_then(validate_embeddings),
                Err(e) => {
                    error!("{}: {}", OP, e);
                    None
                }
            }
        });
        complete(OP, done, result);
    }

    fn load_tts(&self, model_id: &str, path: &str, done: Completion<bool>) {
        self.call_bool("load_tts", done, |f, arena| {
            let id = arena.cstr(model_id)?;
            let path = arena.cstr(path)?;
            // SAFETY: NUL-terminated strings owned by the arena.
            Ok(unsafe { (f.load_tts)(id, path) })
        });
    }

    fn generate_tts(
        &self,
        model_id: &str,
        text: &str,
        max_samples: usize,
        done: Completion<Option<Vec<f32>>>,
    ) {
        const OP: &str = "generate_tts";
        let Some(backend) = self.acquire(OP) else {
            return complete(OP, done, None);
        };
        let model_id = model_id.to_string();
        let text = text.to_string();
        spawn_blocking(OP, move || {
            let mut arena = CallArena::new();
            let outcome = (|| {
                let id = arena.cstr(&model_id)?;
                let text = arena.cstr(&text)?;
                let capacity = c_int::try_from(max_samples)
                    .map_err(|_| MarshalError::ArrayTooLong { len: max_samples })?;
                let mut out = vec![0f32; max_samples];
                // SAFETY: `out` holds `max_samples` floats.
                let written = unsafe {
                    (backend.functions.generate_tts)(id, text, out.as_mut_ptr(), capacity)
                };
                Ok::<_, MarshalError>(read_float_output(OP, out, written))
            })();
            let samples = match outcome {
                Ok(samples) => samples,
                Err(e) => {
                    error!("{}: {}", OP, e);
                    None
                }
            };
            complete(OP, done, samples);
        });
    }

    fn unload_tts(&self, model_id: &str, done: Completion<bool>) {
        self.call_bool("unload_tts", done, |f, arena| {
            let id = arena.cstr(model_id)?;
            // SAFETY: NUL-terminated string owned by the arena.
            Ok(unsafe { (f.unload_tts)(id) })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_library_is_not_found() {
        let dir = tempdir().unwrap();
        let binding = DirectBinding::new(DirectConfig {
            platform: Some(PlatformKey::LinuxX64),
            ..DirectConfig::new(dir.path())
        });

        let err = binding.ensure_loaded().unwrap_err();
        assert!(matches!(err, BindingError::LibraryNotFound(_)));
        assert_eq!(binding.state(), BindingState::Unloaded);
    }

    #[test]
    fn test_unloadable_dependency_is_broken_chain() {
        let dir = tempdir().unwrap();
        let platform = PlatformKey::LinuxX64;
        let first = platform.dependency_paths(dir.path()).remove(0);
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"not a shared object").unwrap();

        let binding = DirectBinding::new(DirectConfig {
            platform: Some(platform),
            ..DirectConfig::new(dir.path())
        });

        let err = binding.ensure_loaded().unwrap_err();
        assert!(matches!(err, BindingError::BrokenDependencyChain { .. }));
    }

    #[test]
    fn test_calls_fail_cleanly_when_not_loadable() {
        let dir = tempdir().unwrap();
        let binding = DirectBinding::new(DirectConfig::new(dir.path()));
        let (tx, rx) = std::sync::mpsc::channel();
        binding.add_turn("k", "user", "hi", Box::new(move |ok| tx.send(ok).unwrap()));
        assert!(!rx.recv().unwrap());
    }

    #[test]
    fn test_free_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let binding = DirectBinding::new(DirectConfig::new(dir.path()));
        binding.free();
        binding.free();
        assert_eq!(binding.state(), BindingState::Freed);
        assert!(matches!(binding.ensure_loaded(), Err(BindingError::Freed)));
    }
}
