use super::protocol::{CallbackId, WorkerReply, WorkerRequest};
use super::registry::{CallbackRegistry, ReplyHandler, Resolved};
use super::worker::{self, WorkerMessage};
use super::{EventSink, SandboxModule};
use crate::backend::{BindingState, InferenceBackend};
use crate::error::{BindingError, Result, SandboxError};
use common::{
    invoke_guarded, Completion, EmbeddingParameters, GenerationConfig, InitializationParameters,
    LogLevel, LogSink, MessageSequence, SequenceLimits, TokenCallback, TracingSink,
};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, error, info, warn};

/// Builds the sandbox module on the worker thread. Called again on a
/// reload after a failed start.
pub type ModuleFactory =
    Arc<dyn Fn() -> std::result::Result<Box<dyn SandboxModule>, SandboxError> + Send + Sync>;

struct WorkerHandle {
    requests: Sender<WorkerMessage>,
    thread: JoinHandle<()>,
}

enum WorkerSlot {
    Unloaded,
    Loading,
    Running(WorkerHandle),
    Freed,
}

/// Binding that talks to the backend through a sandbox worker.
pub struct SandboxedBinding {
    factory: ModuleFactory,
    native_logging: bool,
    log_sink: Arc<dyn LogSink>,
    slot: Mutex<WorkerSlot>,
    load_finished: Condvar,
    registry: Arc<Mutex<CallbackRegistry>>,
}

impl SandboxedBinding {
    pub fn new(factory: ModuleFactory, native_logging: bool) -> Self {
        Self {
            factory,
            native_logging,
            log_sink: Arc::new(TracingSink),
            slot: Mutex::new(WorkerSlot::Unloaded),
            load_finished: Condvar::new(),
            registry: Arc::new(Mutex::new(CallbackRegistry::new())),
        }
    }

    /// Binding over a wasm build of the backend at `path`.
    #[cfg(feature = "wasm-sandbox")]
    pub fn from_module_path(path: impl Into<std::path::PathBuf>, native_logging: bool) -> Self {
        let path = path.into();
        Self::new(
            Arc::new(move || {
                super::wasm::WasmSandbox::from_file(&path)
                    .map(|module| Box::new(module) as Box<dyn SandboxModule>)
            }),
            native_logging,
        )
    }

    /// Route forwarded backend log lines to `sink` instead of `tracing`.
    /// Takes effect for workers started afterwards.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Replies still awaited (token entries included).
    pub fn pending_callbacks(&self) -> usize {
        self.registry.lock().len()
    }

    fn start_worker(&self) -> Result<WorkerHandle> {
        let (reply_tx, reply_rx) = unbounded_channel();
        let events = EventSink::new(reply_tx, self.native_logging);
        let (request_tx, request_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let factory = self.factory.clone();

        let thread = std::thread::Builder::new()
            .name("llmbridge-sandbox".into())
            .spawn(move || worker::run(move || factory(), events, request_rx, ready_tx))
            .map_err(|e| SandboxError::ModuleUnavailable(format!("worker thread: {}", e)))?;

        let started = ready_rx.recv();
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SandboxError::WorkerGone.into());
            }
        }

        spawn_reply_pump(reply_rx, self.registry.clone(), self.log_sink.clone());
        Ok(WorkerHandle {
            requests: request_tx,
            thread,
        })
    }

    fn send(&self, request: &WorkerRequest) -> bool {
        let json = match serde_json::to_string(request) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode {}: {}", request.event(), e);
                return false;
            }
        };
        match &*self.slot.lock() {
            WorkerSlot::Running(handle) => {
                handle.requests.send(WorkerMessage::Request(json)).is_ok()
            }
            _ => false,
        }
    }

    /// Register `handler`, then post the request built around its id.
    fn request<F>(&self, op: &str, handler: ReplyHandler, build: F)
    where
        F: FnOnce(CallbackId) -> WorkerRequest,
    {
        if let Err(e) = self.ensure_loaded() {
            warn!("{}: sandbox unavailable: {}", op, e);
            return handler.fail();
        }
        let registered = self.registry.lock().register(handler);
        let id = match registered {
            Ok(id) => id,
            Err(handler) => {
                error!("{}: no free callback slots", op);
                return handler.fail();
            }
        };
        self.post(op, build(id), id);
    }

    fn post(&self, op: &str, request: WorkerRequest, id: CallbackId) {
        if self.send(&request) {
            return;
        }
        warn!("{}: sandbox worker is not running", op);
        let cancelled = self.registry.lock().cancel(id);
        if let Some(handler) = cancelled {
            handler.fail();
        }
    }

    /// Request with no reply.
    fn notify(&self, op: &str, request: WorkerRequest) {
        if self.ensure_loaded().is_err() || !self.send(&request) {
            warn!("{}: sandbox worker is not running", op);
        }
    }
}

fn spawn_reply_pump(
    mut replies: UnboundedReceiver<String>,
    registry: Arc<Mutex<CallbackRegistry>>,
    sink: Arc<dyn LogSink>,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                while let Some(json) = replies.recv().await {
                    dispatch_reply(&registry, sink.as_ref(), &json);
                }
                fail_pending(&registry);
            });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("llmbridge-sandbox-replies".into())
                .spawn(move || {
                    while let Some(json) = replies.blocking_recv() {
                        dispatch_reply(&registry, sink.as_ref(), &json);
                    }
                    fail_pending(&registry);
                });
            if let Err(e) = spawned {
                error!("Could not start the sandbox reply pump: {}", e);
            }
        }
    }
}

/// Route one reply to its registered handler.
pub(crate) fn dispatch_reply(
    registry: &Mutex<CallbackRegistry>,
    sink: &dyn LogSink,
    json: &str,
) {
    let reply = match serde_json::from_str::<WorkerReply>(json) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Malformed sandbox reply: {}", e);
            return;
        }
    };
    let (callback_id, result) = match reply {
        WorkerReply::Log { level, message } => {
            return sink.log(LogLevel::from(level), &message);
        }
        WorkerReply::Callback {
            callback_id,
            result,
        } => (callback_id, result),
    };

    let resolved = registry.lock().resolve(callback_id);
    match resolved {
        Resolved::Token(on_token) => match result.as_str() {
            Some(token) => {
                invoke_guarded("token", || on_token(token));
            }
            None => warn!("Non-text token event for {:#x}", callback_id),
        },
        Resolved::Final(handler) => handler.complete(callback_id, &result),
        Resolved::Stale => warn!(
            "Reply for stale callback id {:#x} ignored",
            callback_id
        ),
    }
}

/// The worker is gone: every outstanding caller gets its failure value.
fn fail_pending(registry: &Mutex<CallbackRegistry>) {
    let pending = registry.lock().drain();
    if !pending.is_empty() {
        warn!("Sandbox worker exited with {} pending replies", pending.len());
    }
    for handler in pending {
        handler.fail();
    }
}

impl InferenceBackend for SandboxedBinding {
    fn ensure_loaded(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        loop {
            match &*slot {
                WorkerSlot::Running(_) => return Ok(()),
                WorkerSlot::Freed => return Err(BindingError::Freed),
                WorkerSlot::Loading => self.load_finished.wait(&mut slot),
                WorkerSlot::Unloaded => break,
            }
        }
        *slot = WorkerSlot::Loading;
        drop(slot);

        let result = self.start_worker();

        let mut slot = self.slot.lock();
        let outcome = match (result, &*slot) {
            (Ok(handle), WorkerSlot::Freed) => {
                let _ = handle.requests.send(WorkerMessage::Terminate);
                Err(BindingError::Freed)
            }
            (Ok(handle), _) => {
                info!("Sandbox worker running");
                *slot = WorkerSlot::Running(handle);
                Ok(())
            }
            (Err(e), WorkerSlot::Freed) => Err(e),
            (Err(e), _) => {
                error!("Sandbox failed to start: {}", e);
                *slot = WorkerSlot::Unloaded;
                Err(e)
            }
        };
        self.load_finished.notify_all();
        outcome
    }

    fn state(&self) -> BindingState {
        match &*self.slot.lock() {
            WorkerSlot::Unloaded => BindingState::Unloaded,
            WorkerSlot::Loading => BindingState::Loading,
            WorkerSlot::Running(_) => BindingState::Loaded,
            WorkerSlot::Freed => BindingState::Freed,
        }
    }

    fn free(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), WorkerSlot::Freed);
        if let WorkerSlot::Running(handle) = previous {
            // Queued requests ahead of Terminate are still served
            if handle.requests.send(WorkerMessage::Terminate).is_err() {
                debug!("Sandbox worker already stopped");
            }
            if handle.thread.is_finished() {
                let _ = handle.thread.join();
            }
            info!("Sandbox binding freed");
        }
        self.load_finished.notify_all();
    }

    fn dispose(&self, model_ids: &[String]) {
        if self.is_loaded() {
            for model_id in model_ids {
                let name = model_id.clone();
                self.request(
                    "shutdown_model",
                    ReplyHandler::Bool(Box::new(move |ok| {
                        info!("Shut down model '{}' during dispose: {}", name, ok)
                    })),
                    |callback_id| WorkerRequest::ShutdownModel {
                        callback_id,
                        model_id: model_id.clone(),
                    },
                );
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
        if let Err(e) = params.validate() {
            error!("initialize_model: {}", e);
            invoke_guarded("initialize_model", move || done(false));
            return;
        }
        self.request("initialize_model", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::InitializeModel {
                callback_id,
                model_id: model_id.to_string(),
                params: params.clone(),
            }
        });
    }

    fn shutdown_model(&self, model_id: &str, done: Completion<bool>) {
        self.request("shutdown_model", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::ShutdownModel {
                callback_id,
                model_id: model_id.to_string(),
            }
        });
    }

    fn abort_initialize_model(&self, model_id: &str) {
        self.notify(
            "abort_initialize_model",
            WorkerRequest::AbortInitializeModel {
                model_id: model_id.to_string(),
            },
        );
    }

    fn init_context(
        &self,
        model_id: &str,
        key: &str,
        messages: &MessageSequence,
        done: Completion<bool>,
    ) {
        self.request("init_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::InitContext {
                callback_id,
                model_id: model_id.to_string(),
                key: key.to_string(),
                messages: messages.clone(),
            }
        });
    }

    fn get_context(
        &self,
        key: &str,
        limits: SequenceLimits,
        done: Completion<Option<MessageSequence>>,
    ) {
        self.request("get_context", ReplyHandler::Messages(done), |callback_id| {
            WorkerRequest::GetContext {
                callback_id,
                key: key.to_string(),
                limits,
            }
        });
    }

    fn add_turn(&self, key: &str, role: &str, content: &str, done: Completion<bool>) {
        self.request("add_turn_to_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::AddTurn {
                callback_id,
                key: key.to_string(),
                role: role.to_string(),
                content: content.to_string(),
            }
        });
    }

    fn append_to_context(&self, key: &str, content: &str, done: Completion<bool>) {
        self.request("append_to_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::AppendToContext {
                callback_id,
                key: key.to_string(),
                content: content.to_string(),
            }
        });
    }

    fn copy_context(&self, source_key: &str, destination_key: &str, done: Completion<bool>) {
        self.request("copy_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::CopyContext {
                callback_id,
                source_key: source_key.to_string(),
                destination_key: destination_key.to_string(),
            }
        });
    }

    fn free_context(&self, key: &str, done: Completion<bool>) {
        self.request("free_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::FreeContext {
                callback_id,
                key: key.to_string(),
            }
        });
    }

    fn unload_active_context(&self, model_id: &str, done: Completion<bool>) {
        self.request("unload_active_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::UnloadActiveContext {
                callback_id,
                model_id: model_id.to_string(),
            }
        });
    }

    fn cache_context(&self, key: &str, done: Completion<bool>) {
        self.request("cache_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::CacheContext {
                callback_id,
                key: key.to_string(),
            }
        });
    }

    fn load_context(&self, model_id: &str, key: &str, done: Completion<bool>) {
        self.request("load_context", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::LoadContext {
                callback_id,
                model_id: model_id.to_string(),
                key: key.to_string(),
            }
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
        if let Err(e) = config.validate() {
            error!("{}: {}", OP, e);
            invoke_guarded(OP, move || done(false));
            return;
        }
        if let Err(e) = self.ensure_loaded() {
            warn!("{}: sandbox unavailable: {}", OP, e);
            invoke_guarded(OP, move || done(false));
            return;
        }
        let registered = self.registry.lock().register_generation(on_token, done);
        let (token_callback_id, done_callback_id) = match registered {
            Ok(ids) => ids,
            Err(done) => {
                error!("{}: no free callback slots", OP);
                invoke_guarded(OP, move || done(false));
                return;
            }
        };
        let request = WorkerRequest::GenerateResponse {
            token_callback_id,
            done_callback_id,
            model_id: model_id.to_string(),
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
            config: config.clone(),
        };
        self.post(OP, request, done_callback_id);
    }

    fn abort_generation(&self, model_id: &str) {
        self.notify(
            "abort_generation",
            WorkerRequest::AbortGeneration {
                model_id: model_id.to_string(),
            },
        );
    }

    fn get_embeddings_size(&self, model_id: &str, done: Completion<Option<usize>>) {
        self.request("get_embeddings_size", ReplyHandler::Size(done), |callback_id| {
            WorkerRequest::GetEmbeddingsSize {
                callback_id,
                model_id: model_id.to_string(),
            }
        });
    }

    fn compute_embeddings(
        &self,
        model_id: &str,
        text: &str,
        params: &EmbeddingParameters,
        done: Completion<Option<Vec<f32>>>,
    ) {
        self.request("compute_embeddings", ReplyHandler::Floats(done), |callback_id| {
            WorkerRequest::ComputeEmbeddings {
                callback_id,
                model_id: model_id.to_string(),
                text: text.to_string(),
                params: *params,
            }
        });
    }

    fn load_tts(&self, model_id: &str, path: &str, done: Completion<bool>) {
        self.request("load_tts", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::LoadTts {
                callback_id,
                model_id: model_id.to_string(),
                path: path.to_string(),
            }
        });
    }

    fn generate_tts(
        &self,
        model_id: &str,
        text: &str,
        max_samples: usize,
        done: Completion<Option<Vec<f32>>>,
    ) {
        let Ok(max_samples) = u32::try_from(max_samples) else {
            error!("generate_tts: {} samples is too many", max_samples);
            invoke_guarded("generate_tts", move || done(None));
            return;
        };
        self.request("generate_tts", ReplyHandler::Floats(done), |callback_id| {
            WorkerRequest::GenerateTts {
                callback_id,
                model_id: model_id.to_string(),
                text: text.to_string(),
                max_samples,
            }
        });
    }

    fn unload_tts(&self, model_id: &str, done: Completion<bool>) {
        self.request("unload_tts", ReplyHandler::Bool(done), |callback_id| {
            WorkerRequest::UnloadTts {
                callback_id,
                model_id: model_id.to_string(),
            }
        });
    }
}
