//! Low-level FFI surface of the bridge backend library
//!
//! Parameter structs are declared through [`native_struct!`] so their field
//! tables (used by the sandboxed binding and by the packer) cannot drift
//! from the `#[repr(C)]` definitions the direct binding passes by pointer.

use crate::error::BindingError;
use crate::layout::{native_struct, FieldKind};
use common::OptionalValue;
use libloading::Library;
use std::os::raw::{c_char, c_float, c_int, c_void};

native_struct! {
    /// Model loading options (matches `bridge_model_params`)
    pub struct ModelParams : MODEL_PARAMS {
        pub gpu_layers: OptionalValue<i32> => FieldKind::OptI32,
        pub split_mode: OptionalValue<i32> => FieldKind::OptI32,
        pub main_gpu: OptionalValue<i32> => FieldKind::OptI32,
        pub use_mmap: OptionalValue<bool> => FieldKind::OptBool,
        pub use_mlock: OptionalValue<bool> => FieldKind::OptBool,
        pub vocab_only: OptionalValue<bool> => FieldKind::OptBool,
        pub check_tensors: OptionalValue<bool> => FieldKind::OptBool,
        pub enable_abort: OptionalValue<bool> => FieldKind::OptBool,
    }
}

native_struct! {
    /// Context options (matches `bridge_context_params`)
    pub struct ContextParams : CONTEXT_PARAMS {
        pub context_length: OptionalValue<u32> => FieldKind::OptU32,
        pub batch_size: OptionalValue<u32> => FieldKind::OptU32,
        pub ubatch_size: OptionalValue<u32> => FieldKind::OptU32,
        pub seq_max: OptionalValue<u32> => FieldKind::OptU32,
        pub threads: OptionalValue<i32> => FieldKind::OptI32,
        pub threads_batch: OptionalValue<i32> => FieldKind::OptI32,
        pub rope_scaling_type: OptionalValue<i32> => FieldKind::OptI32,
        pub pooling_type: OptionalValue<i32> => FieldKind::OptI32,
        pub attention_type: OptionalValue<i32> => FieldKind::OptI32,
        pub rope_freq_base: OptionalValue<f32> => FieldKind::OptF32,
        pub rope_freq_scale: OptionalValue<f32> => FieldKind::OptF32,
        pub yarn_ext_factor: OptionalValue<f32> => FieldKind::OptF32,
        pub yarn_attn_factor: OptionalValue<f32> => FieldKind::OptF32,
        pub yarn_beta_fast: OptionalValue<f32> => FieldKind::OptF32,
        pub yarn_beta_slow: OptionalValue<f32> => FieldKind::OptF32,
        pub yarn_orig_ctx: OptionalValue<u32> => FieldKind::OptU32,
        pub defrag_threshold: OptionalValue<f32> => FieldKind::OptF32,
        pub embeddings: OptionalValue<bool> => FieldKind::OptBool,
        pub flash_attention: OptionalValue<bool> => FieldKind::OptBool,
        pub enable_abort: OptionalValue<bool> => FieldKind::OptBool,
    }
}

native_struct! {
    pub struct InitParams : INIT_PARAMS {
        pub model_path: *const c_char => FieldKind::Ptr,
        pub model: ModelParams => FieldKind::Struct(&MODEL_PARAMS),
        pub context: ContextParams => FieldKind::Struct(&CONTEXT_PARAMS),
    }
}

native_struct! {
    /// Per-sampler tunables. Arrays are pointer + count pairs.
    pub struct SamplerParams : SAMPLER_PARAMS {
        pub temperature: OptionalValue<f32> => FieldKind::OptF32,
        pub dynatemp_range: OptionalValue<f32> => FieldKind::OptF32,
        pub dynatemp_exponent: OptionalValue<f32> => FieldKind::OptF32,
        pub top_k: OptionalValue<i32> => FieldKind::OptI32,
        pub top_p: OptionalValue<f32> => FieldKind::OptF32,
        pub min_p: OptionalValue<f32> => FieldKind::OptF32,
        pub typical_p: OptionalValue<f32> => FieldKind::OptF32,
        pub mirostat_tau: OptionalValue<f32> => FieldKind::OptF32,
        pub mirostat_eta: OptionalValue<f32> => FieldKind::OptF32,
        pub mirostat_m: OptionalValue<i32> => FieldKind::OptI32,
        pub xtc_probability: OptionalValue<f32> => FieldKind::OptF32,
        pub xtc_threshold: OptionalValue<f32> => FieldKind::OptF32,
        pub dry_multiplier: OptionalValue<f32> => FieldKind::OptF32,
        pub dry_base: OptionalValue<f32> => FieldKind::OptF32,
        pub dry_allowed_length: OptionalValue<i32> => FieldKind::OptI32,
        pub dry_penalty_last_n: OptionalValue<i32> => FieldKind::OptI32,
        pub dry_sequence_breakers: *const *const c_char => FieldKind::Ptr,
        pub n_dry_sequence_breakers: c_int => FieldKind::I32,
        pub penalty_last_n: OptionalValue<i32> => FieldKind::OptI32,
        pub penalty_repeat: OptionalValue<f32> => FieldKind::OptF32,
        pub penalty_frequency: OptionalValue<f32> => FieldKind::OptF32,
        pub penalty_present: OptionalValue<f32> => FieldKind::OptF32,
        pub grammar: *const c_char => FieldKind::Ptr,
        pub grammar_root: *const c_char => FieldKind::Ptr,
        pub grammar_lazy: OptionalValue<bool> => FieldKind::OptBool,
        pub grammar_trigger_patterns: *const *const c_char => FieldKind::Ptr,
        pub n_grammar_trigger_patterns: c_int => FieldKind::I32,
        pub seed: OptionalValue<u32> => FieldKind::OptU32,
    }
}

native_struct! {
    pub struct GenerationParams : GENERATION_PARAMS {
        pub chat_template: *const c_char => FieldKind::Ptr,
        pub apply_chat_template: OptionalValue<bool> => FieldKind::OptBool,
        pub samplers: *const c_int => FieldKind::Ptr,
        pub n_samplers: c_int => FieldKind::I32,
        pub sampler: SamplerParams => FieldKind::Struct(&SAMPLER_PARAMS),
        pub max_tokens: OptionalValue<i32> => FieldKind::OptI32,
        pub chunk_size: OptionalValue<i32> => FieldKind::OptI32,
    }
}

native_struct! {
    pub struct EmbeddingParams : EMBEDDING_PARAMS {
        pub max_embedding_size: u32 => FieldKind::U32,
    }
}

/// Backend log hook: `(level, message)`.
pub type LogCallback = extern "C" fn(level: c_int, message: *const c_char);

/// Streamed token hook: `(user_data, token)`.
pub type TokenCallbackFn = extern "C" fn(user_data: *mut c_void, token: *const c_char);

/// Exported functions of the bridge backend, resolved once at load time.
#[derive(Clone, Copy)]
pub struct BridgeFunctions {
    pub set_log_callback: unsafe extern "C" fn(callback: Option<LogCallback>),

    // Model lifecycle
    pub initialize_model:
        unsafe extern "C" fn(model_id: *const c_char, params: *const InitParams) -> bool,
    pub shutdown_model: unsafe extern "C" fn(model_id: *const c_char) -> bool,
    pub abort_initialize_model: unsafe extern "C" fn(model_id: *const c_char),

    // Contexts
    pub init_context: unsafe extern "C" fn(
        model_id: *const c_char,
        key: *const c_char,
        roles: *const *const c_char,
        contents: *const *const c_char,
        count: c_int,
    ) -> bool,
    pub get_context: unsafe extern "C" fn(
        key: *const c_char,
        roles: *mut c_char,
        contents: *mut c_char,
        max_turns: c_int,
        max_length: c_int,
    ) -> c_int,
    pub add_turn_to_context: unsafe extern "C" fn(
        key: *const c_char,
        role: *const c_char,
        content: *const c_char,
    ) -> bool,
    pub append_to_context:
        unsafe extern "C" fn(key: *const c_char, content: *const c_char) -> bool,
    pub copy_context:
        unsafe extern "C" fn(source_key: *const c_char, destination_key: *const c_char) -> bool,
    pub free_context: unsafe extern "C" fn(key: *const c_char) -> bool,
    pub unload_active_context: unsafe extern "C" fn(model_id: *const c_char) -> bool,
    pub cache_context: unsafe extern "C" fn(key: *const c_char) -> bool,
    pub load_context: unsafe extern "C" fn(model_id: *const c_char, key: *const c_char) -> bool,

    // Generation
    pub generate_response: unsafe extern "C" fn(
        model_id: *const c_char,
        input_key: *const c_char,
        output_key: *const c_char,
        params: *const GenerationParams,
        on_token: TokenCallbackFn,
        user_data: *mut c_void,
    ) -> bool,
    pub abort_generation: unsafe extern "C" fn(model_id: *const c_char),

    // Embeddings
    pub get_embeddings_size: unsafe extern "C" fn(model_id: *const c_char) -> c_int,
    pub compute_embeddings: unsafe extern "C" fn(
        model_id: *const c_char,
        text: *const c_char,
        params: *const EmbeddingParams,
        out: *mut c_float,
        capacity: c_int,
    ) -> c_int,

    // Text to speech
    pub load_tts: unsafe extern "C" fn(model_id: *const c_char, path: *const c_char) -> bool,
    pub generate_tts: unsafe extern "C" fn(
        model_id: *const c_char,
        text: *const c_char,
        out: *mut c_float,
        capacity: c_int,
    ) -> c_int,
    pub unload_tts: unsafe extern "C" fn(model_id: *const c_char) -> bool,
}

macro_rules! resolve {
    ($library:expr, $name:literal) => {
        *$library
            .get(concat!($name, "\0").as_bytes())
            .map_err(|e| BindingError::MissingSymbol {
                symbol: $name,
                message: e.to_string(),
            })?
    };
}

impl BridgeFunctions {
    /// Resolve every export from `library`.
    ///
    /// # Safety
    ///
    /// `library` must be a bridge backend whose exports have exactly the
    /// signatures declared on this struct, and must outlive the returned
    /// function pointers.
    pub unsafe fn load(library: &Library) -> Result<Self, BindingError> {
        Ok(Self {
            set_log_callback: resolve!(library, "set_log_callback"),
            initialize_model: resolve!(library, "initialize_model"),
            shutdown_model: resolve!(library, "shutdown_model"),
            abort_initialize_model: resolve!(library, "abort_initialize_model"),
            init_context: resolve!(library, "init_context"),
            get_context: resolve!(library, "get_context"),
            add_turn_to_context: resolve!(library, "add_turn_to_context"),
            append_to_context: resolve!(library, "append_to_context"),
            copy_context: resolve!(library, "copy_context"),
            free_context: resolve!(library, "free_context"),
            unload_active_context: resolve!(library, "unload_active_context"),
            cache_context: resolve!(library, "cache_context"),
            load_context: resolve!(library, "load_context"),
            generate_response: resolve!(library, "generate_response"),
            abort_generation: resolve!(library, "abort_generation"),
            get_embeddings_size: resolve!(library, "get_embeddings_size"),
            compute_embeddings: resolve!(library, "compute_embeddings"),
            load_tts: resolve!(library, "load_tts"),
            generate_tts: resolve!(library, "generate_tts"),
            unload_tts: resolve!(library, "unload_tts"),
        })
    }
}
