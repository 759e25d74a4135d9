//! The runtime handle: owner of the active binding and of the registered
//! model ids.
//!
//! There is no process-wide singleton. The host constructs one [`Runtime`]
//! and passes clones of it to sessions and lifecycles. Loading is explicit
//! ([`Runtime::initialize`]) and coalesced: however many callers ask while
//! a load is in flight, the loader runs once and every caller hears the
//! same result.

use common::{invoke_guarded, BackendKind, BridgeSettings, Completion};
use llama_binding::{
    Binding, BindingError, DirectBinding, DirectConfig, InferenceBackend, SandboxError,
    SandboxedBinding,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use task_scheduler::PrimaryContext;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Prefix used by [`Runtime::register_model_id`] when none is given.
pub const DEFAULT_MODEL_PREFIX: &str = "model";

/// Builds and loads the binding. Blocking; runs off the caller's thread.
pub trait BindingLoader: Send + Sync {
    fn load(&self, settings: &BridgeSettings) -> Result<Arc<dyn InferenceBackend>, BindingError>;
}

/// Loader choosing the binding variant from `settings.backend`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformLoader;

impl BindingLoader for PlatformLoader {
    fn load(&self, settings: &BridgeSettings) -> Result<Arc<dyn InferenceBackend>, BindingError> {
        let binding = match settings.backend.resolve() {
            BackendKind::Sandboxed => Binding::Sandboxed(sandboxed_binding(settings)?),
            _ => Binding::Direct(DirectBinding::new(DirectConfig {
                native_logging: settings.native_logging,
                ..DirectConfig::new(settings.library_dir.clone())
            })),
        };
        info!("Loading {} binding", binding.variant_name());
        binding.ensure_loaded()?;
        Ok(Arc::new(binding))
    }
}

#[cfg(feature = "wasm-sandbox")]
fn sandboxed_binding(settings: &BridgeSettings) -> Result<SandboxedBinding, BindingError> {
    let module = settings.sandbox_module.clone().ok_or_else(|| {
        SandboxError::ModuleUnavailable("no sandbox_module configured".to_string())
    })?;
    Ok(SandboxedBinding::from_module_path(module, settings.native_logging))
}

#[cfg(not(feature = "wasm-sandbox"))]
fn sandboxed_binding(_settings: &BridgeSettings) -> Result<SandboxedBinding, BindingError> {
    Err(SandboxError::ModuleUnavailable(
        "built without the wasm-sandbox feature".to_string(),
    )
    .into())
}

enum Phase {
    Uninitialized,
    Initializing(Vec<Completion<bool>>),
    Initialized(Arc<dyn InferenceBackend>),
}

struct LoadState {
    phase: Phase,
    /// Bumped by `cleanup`; a load that started under an older epoch is discarded
    epoch: u64,
}

struct RuntimeInner {
    settings: BridgeSettings,
    loader: Arc<dyn BindingLoader>,
    primary: PrimaryContext,
    state: Mutex<LoadState>,
    model_ids: Mutex<BTreeSet<String>>,
}

/// Explicitly owned runtime state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("initialized", &self.is_initialized())
            .field("model_ids", &self.model_ids())
            .finish()
    }
}

impl Runtime {
    pub fn new(
        settings: BridgeSettings,
        loader: Arc<dyn BindingLoader>,
        primary: PrimaryContext,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                loader,
                primary,
                state: Mutex::new(LoadState {
                    phase: Phase::Uninitialized,
                    epoch: 0,
                }),
                model_ids: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Runtime using [`PlatformLoader`].
    pub fn with_platform_loader(settings: BridgeSettings, primary: PrimaryContext) -> Self {
        Self::new(settings, Arc::new(PlatformLoader), primary)
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    pub fn primary(&self) -> &PrimaryContext {
        &self.inner.primary
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Initialized(_))
    }

    /// The loaded binding, if any.
    pub fn binding(&self) -> Option<Arc<dyn InferenceBackend>> {
        match &self.inner.state.lock().phase {
            Phase::Initialized(binding) => Some(binding.clone()),
            _ => None,
        }
    }

    /// Load the binding, or join a load already in flight.
    ///
    /// When already initialized, `callback(true)` runs before this returns.
    /// Otherwise the result is delivered on the primary context once the
    /// load finishes.
    pub fn initialize(&self, callback: Completion<bool>) {
        let mut callback = Some(callback);
        let epoch = {
            let mut state = self.inner.state.lock();
            match &mut state.phase {
                Phase::Initialized(_) => None,
                Phase::Initializing(waiting) => {
                    debug!("Binding load in flight, queueing caller {}", waiting.len() + 1);
                    waiting.extend(callback.take());
                    return;
                }
                Phase::Uninitialized => {
                    state.phase = Phase::Initializing(callback.take().into_iter().collect());
                    Some(state.epoch)
                }
            }
        };
        let Some(epoch) = epoch else {
            if let Some(callback) = callback {
                invoke_guarded("initialize", || callback(true));
            }
            return;
        };

        let runtime = self.clone();
        run_blocking("load", move || {
            let loaded = runtime.inner.loader.load(&runtime.inner.settings);
            runtime.finish_load(epoch, loaded);
        });
    }

    /// Async form of [`Runtime::initialize`]. Resolves once the primary
    /// context has delivered the result.
    pub async fn initialize_async(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.initialize(Box::new(move |ok| {
            let _ = tx.send(ok);
        }));
        rx.await.unwrap_or(false)
    }

    fn finish_load(&self, epoch: u64, loaded: Result<Arc<dyn InferenceBackend>, BindingError>) {
        let (waiting, ok, discarded) = {
            let mut state = self.inner.state.lock();
            let current = state.epoch == epoch;
            let waiting = match std::mem::replace(&mut state.phase, Phase::Uninitialized) {
                Phase::Initializing(waiting) if current => waiting,
                other => {
                    state.phase = other;
                    Vec::new()
                }
            };
            match loaded {
                Ok(binding) if current => {
                    info!("Inference backend loaded");
                    state.phase = Phase::Initialized(binding);
                    (waiting, true, None)
                }
                Ok(binding) => (waiting, false, Some(binding)),
                Err(e) => {
                    error!("Failed to load inference backend: {}", e);
                    (waiting, false, None)
                }
            }
        };

        // Outside the lock: callbacks may re-enter the runtime
        if let Some(binding) = discarded {
            warn!("Runtime was cleaned up during the load; releasing the new binding");
            binding.free();
        }
        for callback in waiting {
            if !self.inner.primary.post(move || callback(ok)) {
                warn!("Primary context closed; initialize result dropped");
            }
        }
    }

    /// Reserve a unique model id: `prefix`, then `prefix_1`, `prefix_2`, …
    pub fn register_model_id(&self, prefix: Option<&str>) -> String {
        let prefix = prefix.unwrap_or(DEFAULT_MODEL_PREFIX);
        let mut ids = self.inner.model_ids.lock();
        let mut candidate = prefix.to_string();
        let mut suffix = 0u64;
        while ids.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}_{}", prefix, suffix);
        }
        ids.insert(candidate.clone());
        debug!("Registered model id '{}'", candidate);
        candidate
    }

    /// Release `id`. Returns `false` if it was not registered.
    pub fn remove_model_id(&self, id: &str) -> bool {
        self.inner.model_ids.lock().remove(id)
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.inner.model_ids.lock().iter().cloned().collect()
    }

    /// Forget the ids, return to uninitialized and dispose the binding
    /// (shutting down every registered model) off the caller's thread.
    ///
    /// The state is reset before this returns, so a later `initialize`
    /// loads afresh. Callers still waiting on a load receive `false`.
    /// `callback` runs on the primary context once the dispose finished,
    /// with `true` when a loaded binding was disposed.
    pub fn cleanup(&self, callback: Completion<bool>) {
        let (binding, waiting) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            match std::mem::replace(&mut state.phase, Phase::Uninitialized) {
                Phase::Initialized(binding) => (Some(binding), Vec::new()),
                Phase::Initializing(waiting) => (None, waiting),
                Phase::Uninitialized => (None, Vec::new()),
            }
        };
        let ids: Vec<String> = std::mem::take(&mut *self.inner.model_ids.lock())
            .into_iter()
            .collect();

        for waiter in waiting {
            self.inner.primary.post(move || waiter(false));
        }

        let Some(binding) = binding else {
            if !self.inner.primary.post(move || callback(false)) {
                debug!("Primary context closed; cleanup result dropped");
            }
            return;
        };

        info!("Disposing inference backend ({} models)", ids.len());
        let primary = self.inner.primary.clone();
        run_blocking("dispose", move || {
            binding.dispose(&ids);
            debug!("Inference backend disposed");
            if !primary.post(move || callback(true)) {
                debug!("Primary context closed; cleanup result dropped");
            }
        });
    }

    /// Async form of [`Runtime::cleanup`].
    pub async fn cleanup_async(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.cleanup(Box::new(move |disposed| {
            let _ = tx.send(disposed);
        }));
        rx.await.unwrap_or(false)
    }
}

/// Run a blocking job on tokio's blocking pool, or a plain thread when no
/// runtime is available.
fn run_blocking<F>(name: &str, job: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name(format!("llmbridge-{}", name))
                .spawn(job);
            if let Err(e) = spawned {
                error!("Could not start the {} thread: {}", name, e);
            }
        }
    }
}
