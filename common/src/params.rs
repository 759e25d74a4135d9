//! Parameter blocks handed to the inference backend.
//!
//! Every tunable is an [`OptionalValue`] so that the backend can tell
//! "caller did not say" apart from "caller asked for the default". The
//! field order here matches the native struct tables in `llama-binding`.

use crate::optional::OptionalValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error("model path must not be empty")]
    EmptyModelPath,

    #[error("sampler {sampler:?} requires '{field}' to be set")]
    MissingSamplerParameter {
        sampler: SamplerType,
        field: &'static str,
    },

    #[error("grammar sampler requested without a grammar")]
    GrammarWithoutSource,
}

/// Model-level loading options (`llama_model_params` subset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelParameters {
    /// Layers offloaded to the GPU (-1 for all)
    pub gpu_layers: OptionalValue<i32>,
    pub split_mode: OptionalValue<i32>,
    pub main_gpu: OptionalValue<i32>,
    pub use_mmap: OptionalValue<bool>,
    pub use_mlock: OptionalValue<bool>,
    pub vocab_only: OptionalValue<bool>,
    pub check_tensors: OptionalValue<bool>,
    /// Allow `abort_initialize_model` to interrupt loading
    pub enable_abort: OptionalValue<bool>,
}

/// Context-level options (`llama_context_params` subset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextParameters {
    pub context_length: OptionalValue<u32>,
    pub batch_size: OptionalValue<u32>,
    pub ubatch_size: OptionalValue<u32>,
    pub seq_max: OptionalValue<u32>,
    pub threads: OptionalValue<i32>,
    pub threads_batch: OptionalValue<i32>,
    pub rope_scaling_type: OptionalValue<i32>,
    pub pooling_type: OptionalValue<i32>,
    pub attention_type: OptionalValue<i32>,
    pub rope_freq_base: OptionalValue<f32>,
    pub rope_freq_scale: OptionalValue<f32>,
    pub yarn_ext_factor: OptionalValue<f32>,
    pub yarn_attn_factor: OptionalValue<f32>,
    pub yarn_beta_fast: OptionalValue<f32>,
    pub yarn_beta_slow: OptionalValue<f32>,
    pub yarn_orig_ctx: OptionalValue<u32>,
    pub defrag_threshold: OptionalValue<f32>,
    pub embeddings: OptionalValue<bool>,
    pub flash_attention: OptionalValue<bool>,
    /// Allow `abort_generation` to interrupt decoding
    pub enable_abort: OptionalValue<bool>,
}

/// Everything `initialize_model` needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializationParameters {
    /// Local GGUF file. Must exist before the model-initialization stage runs.
    pub model_path: String,
    pub model: ModelParameters,
    pub context: ContextParameters,
}

impl InitializationParameters {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.model_path.trim().is_empty() {
            return Err(ParameterError::EmptyModelPath);
        }
        Ok(())
    }
}

/// Sampler stages, in the numbering the backend expects.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerType {
    Penalties = 0,
    Dry = 1,
    TopK = 2,
    TypicalP = 3,
    TopP = 4,
    MinP = 5,
    Xtc = 6,
    Temperature = 7,
    Mirostat = 8,
    MirostatV2 = 9,
    Grammar = 10,
    Greedy = 11,
    Distribution = 12,
}

impl SamplerType {
    pub fn tag(self) -> i32 {
        self as i32
    }
}

/// Per-sampler tunables. Only the blocks for samplers present in the chain
/// need to be populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplerParameters {
    pub temperature: OptionalValue<f32>,
    pub dynatemp_range: OptionalValue<f32>,
    pub dynatemp_exponent: OptionalValue<f32>,
    pub top_k: OptionalValue<i32>,
    pub top_p: OptionalValue<f32>,
    pub min_p: OptionalValue<f32>,
    pub typical_p: OptionalValue<f32>,
    pub mirostat_tau: OptionalValue<f32>,
    pub mirostat_eta: OptionalValue<f32>,
    pub mirostat_m: OptionalValue<i32>,
    pub xtc_probability: OptionalValue<f32>,
    pub xtc_threshold: OptionalValue<f32>,
    pub dry_multiplier: OptionalValue<f32>,
    pub dry_base: OptionalValue<f32>,
    pub dry_allowed_length: OptionalValue<i32>,
    pub dry_penalty_last_n: OptionalValue<i32>,
    pub dry_sequence_breakers: Vec<String>,
    pub penalty_last_n: OptionalValue<i32>,
    pub penalty_repeat: OptionalValue<f32>,
    pub penalty_frequency: OptionalValue<f32>,
    pub penalty_present: OptionalValue<f32>,
    pub grammar: Option<String>,
    pub grammar_root: Option<String>,
    pub grammar_lazy: OptionalValue<bool>,
    pub grammar_trigger_patterns: Vec<String>,
    pub seed: OptionalValue<u32>,
}

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationConfig {
    pub chat_template: Option<String>,
    pub apply_chat_template: OptionalValue<bool>,
    /// Ordered sampler chain
    pub samplers: Vec<SamplerType>,
    pub sampler: SamplerParameters,
    pub max_tokens: OptionalValue<i32>,
    /// Number of tokens batched into one streamed callback
    pub chunk_size: OptionalValue<i32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            chat_template: None,
            apply_chat_template: OptionalValue::some(true),
            samplers: vec![
                SamplerType::Penalties,
                SamplerType::TopK,
                SamplerType::TopP,
                SamplerType::Temperature,
                SamplerType::Distribution,
            ],
            sampler: SamplerParameters {
                temperature: OptionalValue::some(0.8),
                top_k: OptionalValue::some(40),
                top_p: OptionalValue::some(0.95),
                penalty_last_n: OptionalValue::some(64),
                penalty_repeat: OptionalValue::some(1.0),
                ..Default::default()
            },
            max_tokens: OptionalValue::some(512),
            chunk_size: OptionalValue::none(),
        }
    }
}

impl GenerationConfig {
    /// Sampler chain as sent to the backend.
    ///
    /// A configured grammar implies grammar mode, so `Grammar` is put at the
    /// head of the chain when the caller left it out.
    pub fn effective_samplers(&self) -> Vec<SamplerType> {
        let mut chain = self.samplers.clone();
        if self.sampler.grammar.is_some() && !chain.contains(&SamplerType::Grammar) {
            chain.insert(0, SamplerType::Grammar);
        }
        chain
    }

    /// Check that every sampler in the chain has its parameters populated.
    pub fn validate(&self) -> Result<(), ParameterError> {
        let p = &self.sampler;
        for sampler in self.effective_samplers() {
            let required: Vec<(&'static str, bool)> = match sampler {
                SamplerType::Penalties => vec![
                    ("penalty_last_n", p.penalty_last_n.is_some()),
                    ("penalty_repeat", p.penalty_repeat.is_some()),
                ],
                SamplerType::Dry => vec![("dry_multiplier", p.dry_multiplier.is_some())],
                SamplerType::TopK => vec![("top_k", p.top_k.is_some())],
                SamplerType::TypicalP => vec![("typical_p", p.typical_p.is_some())],
                SamplerType::TopP => vec![("top_p", p.top_p.is_some())],
                SamplerType::MinP => vec![("min_p", p.min_p.is_some())],
                SamplerType::Xtc => vec![
                    ("xtc_probability", p.xtc_probability.is_some()),
                    ("xtc_threshold", p.xtc_threshold.is_some()),
                ],
                SamplerType::Temperature => vec![("temperature", p.temperature.is_some())],
                SamplerType::Mirostat => vec![
                    ("mirostat_tau", p.mirostat_tau.is_some()),
                    ("mirostat_eta", p.mirostat_eta.is_some()),
                    ("mirostat_m", p.mirostat_m.is_some()),
                ],
                SamplerType::MirostatV2 => vec![
                    ("mirostat_tau", p.mirostat_tau.is_some()),
                    ("mirostat_eta", p.mirostat_eta.is_some()),
                ],
                SamplerType::Grammar => {
                    if p.grammar.is_none() {
                        return Err(ParameterError::GrammarWithoutSource);
                    }
                    vec![]
                }
                SamplerType::Greedy | SamplerType::Distribution => vec![],
            };

            if let Some((field, _)) = required.iter().find(|(_, present)| !present) {
                return Err(ParameterError::MissingSamplerParameter { sampler, field });
            }
        }
        Ok(())
    }
}

/// Options for `compute_embeddings`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingParameters {
    /// Upper bound on the output vector length, not the measured size
    pub max_embedding_size: u32,
}

impl Default for EmbeddingParameters {
    fn default() -> Self {
        Self {
            max_embedding_size: 4096,
        }
    }
}
