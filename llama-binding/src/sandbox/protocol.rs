//! JSON messages exchanged with the sandbox worker.
//!
//! Requests carry an `event` tag (`call_<export>`) plus the callback ids the
//! worker should answer on. Replies are either a `host_callback` keyed by one
//! of those ids or a forwarded native log line. The shape of a callback's
//! `result` is not self-describing: it is decided by what the registry
//! entry for that id expects.

use common::{
    EmbeddingParameters, GenerationConfig, InitializationParameters, MessageSequence,
    SequenceLimits,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generational callback id, see [`super::registry`].
pub type CallbackId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WorkerRequest {
    #[serde(rename = "call_initialize_model", rename_all = "camelCase")]
    InitializeModel {
        callback_id: CallbackId,
        model_id: String,
        params: InitializationParameters,
    },
    #[serde(rename = "call_shutdown_model", rename_all = "camelCase")]
    ShutdownModel {
        callback_id: CallbackId,
        model_id: String,
    },
    #[serde(rename = "call_abort_initialize_model", rename_all = "camelCase")]
    AbortInitializeModel { model_id: String },

    #[serde(rename = "call_init_context", rename_all = "camelCase")]
    InitContext {
        callback_id: CallbackId,
        model_id: String,
        key: String,
        messages: MessageSequence,
    },
    #[serde(rename = "call_get_context", rename_all = "camelCase")]
    GetContext {
        callback_id: CallbackId,
        key: String,
        limits: SequenceLimits,
    },
    #[serde(rename = "call_add_turn_to_context", rename_all = "camelCase")]
    AddTurn {
        callback_id: CallbackId,
        key: String,
        role: String,
        content: String,
    },
    #[serde(rename = "call_append_to_context", rename_all = "camelCase")]
    AppendToContext {
        callback_id: CallbackId,
        key: String,
        content: String,
    },
    #[serde(rename = "call_copy_context", rename_all = "camelCase")]
    CopyContext {
        callback_id: CallbackId,
        source_key: String,
        destination_key: String,
    },
    #[serde(rename = "call_free_context", rename_all = "camelCase")]
    FreeContext { callback_id: CallbackId, key: String },
    #[serde(rename = "call_unload_active_context", rename_all = "camelCase")]
    UnloadActiveContext {
        callback_id: CallbackId,
        model_id: String,
    },
    #[serde(rename = "call_cache_context", rename_all = "camelCase")]
    CacheContext { callback_id: CallbackId, key: String },
    #[serde(rename = "call_load_context", rename_all = "camelCase")]
    LoadContext {
        callback_id: CallbackId,
        model_id: String,
        key: String,
    },

    /// Tokens stream on `token_callback_id`; `done_callback_id` fires once.
    #[serde(rename = "call_generate_response", rename_all = "camelCase")]
    GenerateResponse {
        token_callback_id: CallbackId,
        done_callback_id: CallbackId,
        model_id: String,
        input_key: String,
        output_key: String,
        config: GenerationConfig,
    },
    #[serde(rename = "call_abort_generation", rename_all = "camelCase")]
    AbortGeneration { model_id: String },

    #[serde(rename = "call_get_embeddings_size", rename_all = "camelCase")]
    GetEmbeddingsSize {
        callback_id: CallbackId,
        model_id: String,
    },
    #[serde(rename = "call_compute_embeddings", rename_all = "camelCase")]
    ComputeEmbeddings {
        callback_id: CallbackId,
        model_id: String,
        text: String,
        params: EmbeddingParameters,
    },

    #[serde(rename = "call_load_tts", rename_all = "camelCase")]
    LoadTts {
        callback_id: CallbackId,
        model_id: String,
        path: String,
    },
    #[serde(rename = "call_generate_tts", rename_all = "camelCase")]
    GenerateTts {
        callback_id: CallbackId,
        model_id: String,
        text: String,
        max_samples: u32,
    },
    #[serde(rename = "call_unload_tts", rename_all = "camelCase")]
    UnloadTts {
        callback_id: CallbackId,
        model_id: String,
    },
}

impl WorkerRequest {
    /// Event tag, for logging.
    pub fn event(&self) -> &'static str {
        match self {
            Self::InitializeModel { .. } => "call_initialize_model",
            Self::ShutdownModel { .. } => "call_shutdown_model",
            Self::AbortInitializeModel { .. } => "call_abort_initialize_model",
            Self::InitContext { .. } => "call_init_context",
            Self::GetContext { .. } => "call_get_context",
            Self::AddTurn { .. } => "call_add_turn_to_context",
            Self::AppendToContext { .. } => "call_append_to_context",
            Self::CopyContext { .. } => "call_copy_context",
            Self::FreeContext { .. } => "call_free_context",
            Self::UnloadActiveContext { .. } => "call_unload_active_context",
            Self::CacheContext { .. } => "call_cache_context",
            Self::LoadContext { .. } => "call_load_context",
            Self::GenerateResponse { .. } => "call_generate_response",
            Self::AbortGeneration { .. } => "call_abort_generation",
            Self::GetEmbeddingsSize { .. } => "call_get_embeddings_size",
            Self::ComputeEmbeddings { .. } => "call_compute_embeddings",
            Self::LoadTts { .. } => "call_load_tts",
            Self::GenerateTts { .. } => "call_generate_tts",
            Self::UnloadTts { .. } => "call_unload_tts",
        }
    }

    /// The id that must be answered if the request cannot be served.
    ///
    /// For generation this is the done id; the token id goes with it.
    pub fn completion_id(&self) -> Option<CallbackId> {
        match self {
            Self::AbortInitializeModel { .. } | Self::AbortGeneration { .. } => None,
            Self::GenerateResponse {
                done_callback_id, ..
            } => Some(*done_callback_id),
            Self::InitializeModel { callback_id, .. }
            | Self::ShutdownModel { callback_id, .. }
            | Self::InitContext { callback_id, .. }
            | Self::GetContext { callback_id, .. }
            | Self::AddTurn { callback_id, .. }
            | Self::AppendToContext { callback_id, .. }
            | Self::CopyContext { callback_id, .. }
            | Self::FreeContext { callback_id, .. }
            | Self::UnloadActiveContext { callback_id, .. }
            | Self::CacheContext { callback_id, .. }
            | Self::LoadContext { callback_id, .. }
            | Self::GetEmbeddingsSize { callback_id, .. }
            | Self::ComputeEmbeddings { callback_id, .. }
            | Self::LoadTts { callback_id, .. }
            | Self::GenerateTts { callback_id, .. }
            | Self::UnloadTts { callback_id, .. } => Some(*callback_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WorkerReply {
    #[serde(rename = "host_callback", rename_all = "camelCase")]
    Callback {
        callback_id: CallbackId,
        result: Value,
    },
    #[serde(rename = "log")]
    Log { level: i32, message: String },
}

/// Booleans travel as the strings `"true"` / `"false"`.
pub fn bool_result(value: bool) -> Value {
    Value::String(value.to_string())
}

pub fn decode_bool(result: &Value) -> bool {
    match result {
        Value::String(s) => s == "true",
        Value::Bool(b) => *b,
        _ => false,
    }
}

/// Float vectors travel as arrays where a non-finite element is `null`.
pub fn floats_result(values: &[f32]) -> Value {
    Value::Array(
        values
            .iter()
            .map(|v| {
                serde_json::Number::from_f64(f64::from(*v))
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}
