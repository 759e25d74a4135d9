//! Capability trait shared by both binding variants.

use crate::direct::DirectBinding;
use crate::error::Result;
use crate::sandbox::SandboxedBinding;
use common::{
    Completion, EmbeddingParameters, GenerationConfig, InitializationParameters, MessageSequence,
    SequenceLimits, TokenCallback,
};

/// Lifecycle of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unloaded,
    Loading,
    Loaded,
    Freed,
}

/// Everything a session or the runtime can ask of the inference backend.
///
/// Every operation reports through its completion exactly once. Failures
/// (not loaded, marshaling, native `false`) arrive as `false` / `None`;
/// nothing is returned as an error or panic past this boundary. Completions
/// may run on a background thread.
pub trait InferenceBackend: Send + Sync {
    /// Load the backend. A no-op once loaded.
    fn ensure_loaded(&self) -> Result<()>;

    fn state(&self) -> BindingState;

    fn is_loaded(&self) -> bool {
        self.state() == BindingState::Loaded
    }

    /// Release the backend. Idempotent.
    fn free(&self);

    /// Shut down every model in `model_ids`, then free. Blocks until the
    /// backend has answered; keep it off the primary context.
    fn dispose(&self, model_ids: &[String]);

    // Model lifecycle. Blocking natively; runs in the background.
    fn initialize_model(
        &self,
        model_id: &str,
        params: &InitializationParameters,
        done: Completion<bool>,
    );
    fn shutdown_model(&self, model_id: &str, done: Completion<bool>);
    fn abort_initialize_model(&self, model_id: &str);

    // Contexts
    fn init_context(
        &self,
        model_id: &str,
        key: &str,
        messages: &MessageSequence,
        done: Completion<bool>,
    );
    fn get_context(
        &self,
        key: &str,
        limits: SequenceLimits,
        done: Completion<Option<MessageSequence>>,
    );
    fn add_turn(&self, key: &str, role: &str, content: &str, done: Completion<bool>);
    fn append_to_context(&self, key: &str, content: &str, done: Completion<bool>);
    fn copy_context(&self, source_key: &str, destination_key: &str, done: Completion<bool>);
    fn free_context(&self, key: &str, done: Completion<bool>);
    fn unload_active_context(&self, model_id: &str, done: Completion<bool>);
    fn cache_context(&self, key: &str, done: Completion<bool>);
    fn load_context(&self, model_id: &str, key: &str, done: Completion<bool>);

    // Generation. Blocking natively; runs in the background.
    fn generate_response(
        &self,
        model_id: &str,
        input_key: &str,
        output_key: &str,
        config: &GenerationConfig,
        on_token: TokenCallback,
        done: Completion<bool>,
    );
    fn abort_generation(&self, model_id: &str);

    // Embeddings
    fn get_embeddings_size(&self, model_id: &str, done: Completion<Option<usize>>);
    /// `None` when the call fails or any element is NaN.
    fn compute_embeddings(
        &self,
        model_id: &str,
        text: &str,
        params: &EmbeddingParameters,
        done: Completion<Option<Vec<f32>>>,
    );

    // Text to speech
    fn load_tts(&self, model_id: &str, path: &str, done: Completion<bool>);
    fn generate_tts(
        &self,
        model_id: &str,
        text: &str,
        max_samples: usize,
        done: Completion<Option<Vec<f32>>>,
    );
    fn unload_tts(&self, model_id: &str, done: Completion<bool>);
}

/// The active binding, selected once at startup.
pub enum Binding {
    Direct(DirectBinding),
    Sandboxed(SandboxedBinding),
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => write!(f, "Binding::Direct({:?})", self.state()),
            Self::Sandboxed(_) => write!(f, "Binding::Sandboxed({:?})", self.state()),
        }
    }
}

impl Binding {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Sandboxed(_) => "sandboxed",
        }
    }
}

macro_rules! delegate {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Binding::Direct($b) => $call,
            Binding::Sandboxed($b) => $call,
        }
    };
}

impl InferenceBackend for Binding {
    fn ensure_loaded(&self) -> Result<()> {
        delegate!(self, b => b.ensure_loaded())
    }

    fn state(&self) -> BindingState {
        delegate!(self, b => b.state())
    }

    fn free(&self) {
        delegate!(self, b => b.free())
    }

    fn dispose(&self, model_ids: &[String]) {
        delegate!(self, b => b.dispose(model_ids))
    }

    fn initialize_model(
        &self,
        model_id: &str,
        params: &InitializationParameters,
        done: Completion<bool>,
    ) {
        delegate!(self, b => b.initialize_model(model_id, params, done))
    }

    fn shutdown_model(&self, model_id: &str, done: Completion<bool>) {
        delegate!(self, b => b.shutdown_model(model_id, done))
    }

    fn abort_initialize_model(&self, model_id: &str) {
        delegate!(self, b => b.abort_initialize_model(model_id))
    }

    fn init_context(
        &self,
        model_id: &str,
        key: &str,
        messages: &MessageSequence,
        done: Completion<bool>,
    ) {
        delegate!(self, b => b.init_context(model_id, key, messages, done))
    }

    fn get_context(
        &self,
        key: &str,
        limits: SequenceLimits,
        done: Completion<Option<MessageSequence>>,
    ) {
        delegate!(self, b => b.get_context(key, limits, done))
    }

    fn add_turn(&self, key: &str, role: &str, content: &str, done: Completion<bool>) {
        delegate!(self, b => b.add_turn(key, role, content, done))
    }

    fn append_to_context(&self, key: &str, content: &str, done: Completion<bool>) {
        delegate!(self, b => b.append_to_context(key, content, done))
    }

    fn copy_context(&self, source_key: &str, destination_key: &str, done: Completion<bool>) {
        delegate!(self, b => b.copy_context(source_key, destination_key, done))
    }

    fn free_context(&self, key: &str, done: Completion<bool>) {
        delegate!(self, b => b.free_context(key, done))
    }

    fn unload_active_context(&self, model_id: &str, done: Completion<bool>) {
        delegate!(self, b => b.unload_active_context(model_id, done))
    }

    fn cache_context(&self, key: &str, done: Completion<bool>) {
        delegate!(self, b => b.cache_context(key, done))
    }

    fn load_context(&self, model_id: &str, key: &str, done: Completion<bool>) {
        delegate!(self, b => b.load_context(model_id, key, done))
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
        delegate!(self, b => b.generate_response(model_id, input_key, output_key, config, on_token, done))
    }

    fn abort_generation(&self, model_id: &str) {
        delegate!(self, b => b.abort_generation(model_id))
    }

    fn get_embeddings_size(&self, model_id: &str, done: Completion<Option<usize>>) {
        delegate!(self, b => b.get_embeddings_size(model_id, done))
    }

    fn compute_embeddings(
        &self,
        model_id: &str,
        text: &str,
        params: &EmbeddingParameters,
        done: Completion<Option<Vec<f32>>>,
    ) {
        delegate!(self, b => b.compute_embeddings(model_id, text, params, done))
    }

    fn load_tts(&self, model_id: &str, path: &str, done: Completion<bool>) {
        delegate!(self, b => b.load_tts(model_id, path, done))
    }

    fn generate_tts(
        &self,
        model_id: &str,
        text: &str,
        max_samples: usize,
        done: Completion<Option<Vec<f32>>>,
    ) {
        delegate!(self, b => b.generate_tts(model_id, text, max_samples, done))
    }

    fn unload_tts(&self, model_id: &str, done: Completion<bool>) {
        delegate!(self, b => b.unload_tts(model_id, done))
    }
}
