//! In-memory inference backend and loaders shared by the runtime tests.

#![allow(dead_code)]

use common::{
    BridgeSettings, Completion, EmbeddingParameters, GenerationConfig, InitializationParameters,
    MessageSequence, SequenceLimits, TokenCallback,
};
use llama_binding::{BindingError, BindingState, InferenceBackend};
use llmbridge_runtime::BindingLoader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REPLY_TOKENS: [&str; 3] = ["Hi", " there", "!"];

#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    pub contexts: HashMap<String, MessageSequence>,
    pub models: Vec<String>,
    pub disposed: Option<Vec<String>>,
    /// Number of upcoming `initialize_model` calls that report `false`
    pub failing_initializations: usize,
    /// How long `dispose` blocks before shutting the models down
    pub dispose_delay: Duration,
    pub freed: bool,
}

/// Backend that keeps contexts in a map and completes the slow calls on
/// background threads after a short delay.
#[derive(Default)]
pub struct FakeBackend {
    pub state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn context(&self, key: &str) -> Option<MessageSequence> {
        self.state.lock().unwrap().contexts.get(key).cloned()
    }

    pub fn fail_next_initializations(&self, count: usize) {
        self.state.lock().unwrap().failing_initializations = count;
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }
}

/// Complete on another thread, as the real bindings do.
fn later<T: Send + 'static>(delay_ms: u64, done: Completion<T>, value: T) {
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(delay_ms));
        done(value);
    });
}

impl InferenceBackend for FakeBackend {
    fn ensure_loaded(&self) -> llama_binding::Result<()> {
        Ok(())
    }

    fn state(&self) -> BindingState {
        if self.state.lock().unwrap().freed {
            BindingState::Freed
        } else {
            BindingState::Loaded
        }
    }

    fn free(&self) {
        self.record("free");
        self.state.lock().unwrap().freed = true;
    }

    fn dispose(&self, model_ids: &[String]) {
        self.record("dispose");
        let delay = self.state.lock().unwrap().dispose_delay;
        std::thread::sleep(delay);
        let mut state = self.state.lock().unwrap();
        state.disposed = Some(model_ids.to_vec());
        state.freed = true;
    }

    fn initialize_model(
        &self,
        model_id: &str,
        params: &InitializationParameters,
        done: Completion<bool>,
    ) {
        self.record(format!("initialize_model:{}:{}", model_id, params.model_path));
        let ok = {
            let mut state = self.state.lock().unwrap();
            if state.failing_initializations > 0 {
                state.failing_initializations -= 1;
                false
            } else {
                state.models.push(model_id.to_string());
                true
            }
        };
        later(10, done, ok);
    }

    fn shutdown_model(&self, model_id: &str, done: Completion<bool>) {
        self.record(format!("shutdown_model:{}", model_id));
        let ok = {
            let mut state = self.state.lock().unwrap();
            let before = state.models.len();
            state.models.retain(|m| m != model_id);
            state.models.len() < before
        };
        later(5, done, ok);
    }

    fn abort_initialize_model(&self, model_id: &str) {
        self.record(format!("abort_initialize_model:{}", model_id));
    }

    fn init_context(
        &self,
        _model_id: &str,
        key: &str,
        messages: &MessageSequence,
        done: Completion<bool>,
    ) {
        self.record(format!("init_context:{}", key));
        self.state
            .lock()
            .unwrap()
            .contexts
            .insert(key.to_string(), messages.clone());
        done(true);
    }

    fn get_context(
        &self,
        key: &str,
        _limits: SequenceLimits,
        done: Completion<Option<MessageSequence>>,
    ) {
        self.record(format!("get_context:{}", key));
        done(self.context(key));
    }

    fn add_turn(&self, key: &str, role: &str, content: &str, done: Completion<bool>) {
        self.record(format!("add_turn:{}:{}", key, content));
        let ok = match self.state.lock().unwrap().contexts.get_mut(key) {
            Some(context) => {
                context.push(role, content);
                true
            }
            None => false,
        };
        // Slow enough that an unordered caller would overtake it
        later(30, done, ok);
    }

    fn append_to_context(&self, key: &str, content: &str, done: Completion<bool>) {
        self.record(format!("append:{}", key));
        let mut state = self.state.lock().unwrap();
        let ok = match state.contexts.get_mut(key) {
            Some(context) => {
                let mut messages = std::mem::take(context).into_inner();
                match messages.last_mut() {
                    Some(last) => last.content.push_str(content),
                    None => messages.push(common::Message::new("user", content)),
                }
                *context = messages.into_iter().collect();
                true
            }
            None => false,
        };
        drop(state);
        done(ok);
    }

    fn copy_context(&self, source_key: &str, destination_key: &str, done: Completion<bool>) {
        self.record(format!("copy_context:{}->{}", source_key, destination_key));
        let mut state = self.state.lock().unwrap();
        let ok = match state.contexts.get(source_key).cloned() {
            Some(source) => {
                state.contexts.insert(destination_key.to_string(), source);
                true
            }
            None => false,
        };
        drop(state);
        done(ok);
    }

    fn free_context(&self, key: &str, done: Completion<bool>) {
        self.record(format!("free_context:{}", key));
        let removed = self.state.lock().unwrap().contexts.remove(key).is_some();
        done(removed);
    }

    fn unload_active_context(&self, model_id: &str, done: Completion<bool>) {
        self.record(format!("unload_active_context:{}", model_id));
        done(true);
    }

    fn cache_context(&self, key: &str, done: Completion<bool>) {
        self.record(format!("cache_context:{}", key));
        done(true);
    }

    fn load_context(&self, model_id: &str, key: &str, done: Completion<bool>) {
        self.record(format!("load_context:{}:{}", model_id, key));
        done(true);
    }

    fn generate_response(
        &self,
        _model_id: &str,
        input_key: &str,
        output_key: &str,
        _config: &GenerationConfig,
        on_token: TokenCallback,
        done: Completion<bool>,
    ) {
        self.record(format!("generate:{}->{}", input_key, output_key));
        let Some(mut conversation) = self.context(input_key) else {
            done(false);
            return;
        };
        conversation.push("assistant", REPLY_TOKENS.concat());
        self.state
            .lock()
            .unwrap()
            .contexts
            .insert(output_key.to_string(), conversation);

        std::thread::spawn(move || {
            for token in REPLY_TOKENS {
                std::thread::sleep(Duration::from_millis(5));
                on_token(token);
            }
            done(true);
        });
    }

    fn abort_generation(&self, model_id: &str) {
        self.record(format!("abort_generation:{}", model_id));
    }

    fn get_embeddings_size(&self, _model_id: &str, done: Completion<Option<usize>>) {
        done(Some(4));
    }

    fn compute_embeddings(
        &self,
        _model_id: &str,
        text: &str,
        params: &EmbeddingParameters,
        done: Completion<Option<Vec<f32>>>,
    ) {
        self.record(format!("compute_embeddings:{}", text));
        let size = (params.max_embedding_size as usize).min(4);
        later(5, done, Some((0..size).map(|i| i as f32 * 0.5).collect()));
    }

    fn load_tts(&self, _model_id: &str, _path: &str, done: Completion<bool>) {
        done(true);
    }

    fn generate_tts(
        &self,
        _model_id: &str,
        _text: &str,
        max_samples: usize,
        done: Completion<Option<Vec<f32>>>,
    ) {
        done(Some(vec![0.0; max_samples.min(16)]));
    }

    fn unload_tts(&self, _model_id: &str, done: Completion<bool>) {
        done(true);
    }
}

/// Always hands out the same backend.
pub struct StaticLoader {
    pub backend: Arc<FakeBackend>,
    pub loads: AtomicUsize,
}

impl StaticLoader {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            loads: AtomicUsize::new(0),
        })
    }
}

impl BindingLoader for StaticLoader {
    fn load(&self, _: &BridgeSettings) -> Result<Arc<dyn InferenceBackend>, BindingError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.clone())
    }
}

/// Counts loads and takes a while to finish each one.
pub struct SlowLoader {
    pub backend: Option<Arc<FakeBackend>>,
    pub delay: Duration,
    pub loads: AtomicUsize,
}

impl SlowLoader {
    pub fn succeeding(backend: Arc<FakeBackend>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: Some(backend),
            delay,
            loads: AtomicUsize::new(0),
        })
    }

    pub fn failing(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            backend: None,
            delay,
            loads: AtomicUsize::new(0),
        })
    }
}

impl BindingLoader for SlowLoader {
    fn load(&self, _: &BridgeSettings) -> Result<Arc<dyn InferenceBackend>, BindingError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        match &self.backend {
            Some(backend) => Ok(backend.clone()),
            None => Err(BindingError::LibraryNotFound("libbackend".into())),
        }
    }
}

/// Settings pointing every path into `dir`, with fast retries.
pub fn test_settings(dir: &std::path::Path) -> BridgeSettings {
    let mut settings = BridgeSettings::default();
    settings.library_dir = dir.join("libs");
    settings.models_dir = dir.to_path_buf();
    settings.retry.delay_ms = 10;
    settings.retry.max_delay_ms = Some(50);
    settings
}
