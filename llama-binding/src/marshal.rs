//! Managed parameters → packed native structs, and native output → managed.
//!
//! The pack functions are shared by both bindings; only the
//! [`PointerAllocator`] differs (a [`CallArena`] for the direct binding, a
//! tracking allocator over sandbox memory for the sandboxed one).

use crate::error::MarshalError;
use crate::ffi::{EMBEDDING_PARAMS, GENERATION_PARAMS, INIT_PARAMS};
use crate::layout::{Abi, PackedStruct, PointerAllocator};
use common::{
    EmbeddingParameters, GenerationConfig, InitializationParameters, Message, MessageSequence,
    SequenceLimits,
};
use std::ffi::{c_char, CString};

/// Owns every buffer allocated for one direct native call.
///
/// Dropping the arena releases them, on every exit path.
#[derive(Default)]
pub struct CallArena {
    blocks: Vec<Box<[u64]>>,
    strings: Vec<CString>,
}

impl CallArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// NUL-terminated copy of `value`, valid until the arena is dropped.
    pub fn cstr(&mut self, value: &str) -> Result<*const c_char, MarshalError> {
        let owned = CString::new(value)
            .map_err(|_| MarshalError::InteriorNul(value.chars().take(32).collect()))?;
        // The heap buffer does not move when the CString is moved into the Vec
        let ptr = owned.as_ptr();
        self.strings.push(owned);
        Ok(ptr)
    }

    /// Number of live allocations (strings and blocks).
    pub fn allocations(&self) -> usize {
        self.blocks.len() + self.strings.len()
    }
}

impl PointerAllocator for CallArena {
    fn abi(&self) -> Abi {
        Abi::Host
    }

    fn alloc(&mut self, bytes: &[u8], align: usize) -> Result<u64, MarshalError> {
        if align > 8 {
            return Err(MarshalError::Allocation(format!(
                "alignment {} is not supported",
                align
            )));
        }
        let mut block = vec![0u64; bytes.len().div_ceil(8).max(1)].into_boxed_slice();
        // SAFETY: the block has at least `bytes.len()` bytes and is u64-aligned.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(block.as_mut_ptr().cast::<u8>(), bytes.len())
        };
        dst.copy_from_slice(bytes);
        let address = block.as_ptr() as usize as u64;
        self.blocks.push(block);
        Ok(address)
    }
}

/// Pack `params` as an `InitParams` block.
pub fn pack_init_params(
    params: &InitializationParameters,
    alloc: &mut dyn PointerAllocator,
) -> Result<PackedStruct, MarshalError> {
    let mut packed = PackedStruct::new(&INIT_PARAMS, alloc.abi());
    let model_path = alloc.alloc_cstr(&params.model_path)?;

    let mut w = packed.writer();
    w.set_ptr("model_path", model_path)?;

    let m = &params.model;
    let mut model = w.nested("model")?;
    model.set("gpu_layers", m.gpu_layers)?;
    model.set("split_mode", m.split_mode)?;
    model.set("main_gpu", m.main_gpu)?;
    model.set("use_mmap", m.use_mmap)?;
    model.set("use_mlock", m.use_mlock)?;
    model.set("vocab_only", m.vocab_only)?;
    model.set("check_tensors", m.check_tensors)?;
    model.set("enable_abort", m.enable_abort)?;

    let c = &params.context;
    let mut context = w.nested("context")?;
    context.set("context_length", c.context_length)?;
    context.set("batch_size", c.batch_size)?;
    context.set("ubatch_size", c.ubatch_size)?;
    context.set("seq_max", c.seq_max)?;
    context.set("threads", c.threads)?;
    context.set("threads_batch", c.threads_batch)?;
    context.set("rope_scaling_type", c.rope_scaling_type)?;
    context.set("pooling_type", c.pooling_type)?;
    context.set("attention_type", c.attention_type)?;
    context.set("rope_freq_base", c.rope_freq_base)?;
    context.set("rope_freq_scale", c.rope_freq_scale)?;
    context.set("yarn_ext_factor", c.yarn_ext_factor)?;
    context.set("yarn_attn_factor", c.yarn_attn_factor)?;
    context.set("yarn_beta_fast", c.yarn_beta_fast)?;
    context.set("yarn_beta_slow", c.yarn_beta_slow)?;
    context.set("yarn_orig_ctx", c.yarn_orig_ctx)?;
    context.set("defrag_threshold", c.defrag_threshold)?;
    context.set("embeddings", c.embeddings)?;
    context.set("flash_attention", c.flash_attention)?;
    context.set("enable_abort", c.enable_abort)?;

    Ok(packed)
}

/// Pack `config` as a `GenerationParams` block, with the effective
/// sampler chain (grammar prepended when configured).
pub fn pack_generation_params(
    config: &GenerationConfig,
    alloc: &mut dyn PointerAllocator,
) -> Result<PackedStruct, MarshalError> {
    let mut packed = PackedStruct::new(&GENERATION_PARAMS, alloc.abi());

    let chain: Vec<i32> = config.effective_samplers().iter().map(|s| s.tag()).collect();
    let chat_template = match &config.chat_template {
        Some(template) => alloc.alloc_cstr(template)?,
        None => 0,
    };
    let samplers = alloc.alloc_i32_array(&chain)?;

    let s = &config.sampler;
    let grammar = match &s.grammar {
        Some(grammar) => alloc.alloc_cstr(grammar)?,
        None => 0,
    };
    let grammar_root = match &s.grammar_root {
        Some(root) => alloc.alloc_cstr(root)?,
        None => 0,
    };
    let breakers = alloc.alloc_str_array(&s.dry_sequence_breakers)?;
    let triggers = alloc.alloc_str_array(&s.grammar_trigger_patterns)?;

    let mut w = packed.writer();
    w.set_ptr("chat_template", chat_template)?;
    w.set("apply_chat_template", config.apply_chat_template)?;
    w.set_ptr("samplers", samplers)?;
    w.set("n_samplers", array_len(chain.len())?)?;
    w.set("max_tokens", config.max_tokens)?;
    w.set("chunk_size", config.chunk_size)?;

    let mut sp = w.nested("sampler")?;
    sp.set("temperature", s.temperature)?;
    sp.set("dynatemp_range", s.dynatemp_range)?;
    sp.set("dynatemp_exponent", s.dynatemp_exponent)?;
    sp.set("top_k", s.top_k)?;
    sp.set("top_p", s.top_p)?;
    sp.set("min_p", s.min_p)?;
    sp.set("typical_p", s.typical_p)?;
    sp.set("mirostat_tau", s.mirostat_tau)?;
    sp.set("mirostat_eta", s.mirostat_eta)?;
    sp.set("mirostat_m", s.mirostat_m)?;
    sp.set("xtc_probability", s.xtc_probability)?;
    sp.set("xtc_threshold", s.xtc_threshold)?;
    sp.set("dry_multiplier", s.dry_multiplier)?;
    sp.set("dry_base", s.dry_base)?;
    sp.set("dry_allowed_length", s.dry_allowed_length)?;
    sp.set("dry_penalty_last_n", s.dry_penalty_last_n)?;
    sp.set_ptr("dry_sequence_breakers", breakers)?;
    sp.set(
        "n_dry_sequence_breakers",
        array_len(s.dry_sequence_breakers.len())?,
    )?;
    sp.set("penalty_last_n", s.penalty_last_n)?;
    sp.set("penalty_repeat", s.penalty_repeat)?;
    sp.set("penalty_frequency", s.penalty_frequency)?;
    sp.set("penalty_present", s.penalty_present)?;
    sp.set_ptr("grammar", grammar)?;
    sp.set_ptr("grammar_root", grammar_root)?;
    sp.set("grammar_lazy", s.grammar_lazy)?;
    sp.set_ptr("grammar_trigger_patterns", triggers)?;
    sp.set(
        "n_grammar_trigger_patterns",
        array_len(s.grammar_trigger_patterns.len())?,
    )?;
    sp.set("seed", s.seed)?;

    Ok(packed)
}

pub fn pack_embedding_params(
    params: &EmbeddingParameters,
    abi: Abi,
) -> Result<PackedStruct, MarshalError> {
    let mut packed = PackedStruct::new(&EMBEDDING_PARAMS, abi);
    packed
        .writer()
        .set("max_embedding_size", params.max_embedding_size)?;
    Ok(packed)
}

fn array_len(len: usize) -> Result<i32, MarshalError> {
    i32::try_from(len).map_err(|_| MarshalError::ArrayTooLong { len })
}

/// Caller-allocated output columns for `get_context`.
///
/// Each column is `max_turn_count` slots of `max_string_length` bytes;
/// the backend writes one NUL-terminated string per slot.
pub struct MessageBuffers {
    pub roles: Vec<u8>,
    pub contents: Vec<u8>,
    pub limits: SequenceLimits,
}

impl MessageBuffers {
    pub fn new(limits: SequenceLimits) -> Result<Self, MarshalError> {
        let bytes = limits
            .column_bytes()
            .ok_or(MarshalError::ArrayTooLong { len: limits.max_turn_count })?;
        array_len(limits.max_turn_count)?;
        array_len(limits.max_string_length)?;
        Ok(Self {
            roles: vec![0; bytes],
            contents: vec![0; bytes],
            limits,
        })
    }

    /// Decode the first `count` turns.
    pub fn read(&self, count: i32) -> Result<MessageSequence, MarshalError> {
        read_message_columns(&self.roles, &self.contents, count, self.limits)
    }
}

/// Decode `count` turns from two fixed-slot columns, with bounds checks.
pub fn read_message_columns(
    roles: &[u8],
    contents: &[u8],
    count: i32,
    limits: SequenceLimits,
) -> Result<MessageSequence, MarshalError> {
    let count = usize::try_from(count).map_err(|_| MarshalError::OutOfBounds {
        offset: 0,
        len: 0,
    })?;
    if count > limits.max_turn_count {
        return Err(MarshalError::OutOfBounds {
            offset: count,
            len: limits.max_turn_count,
        });
    }

    let width = limits.max_string_length;
    (0..count)
        .map(|i| {
            let role = read_slot(roles, i, width)?;
            let content = read_slot(contents, i, width)?;
            Ok(Message::new(role, content))
        })
        .collect()
}

fn read_slot(column: &[u8], index: usize, width: usize) -> Result<String, MarshalError> {
    let start = index * width;
    let slot = column
        .get(start..start + width)
        .ok_or(MarshalError::OutOfBounds { offset: start, len: width })?;
    // A slot filled to the brim without a terminator is taken whole
    let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&slot[..end]).into_owned())
}

/// Fill two columns the way the backend does; used by in-process backends.
pub fn write_message_columns(
    messages: &MessageSequence,
    roles: &mut [u8],
    contents: &mut [u8],
    limits: SequenceLimits,
) -> usize {
    let width = limits.max_string_length;
    if width == 0 {
        return 0;
    }
    let mut written = 0;
    for (i, message) in messages.iter().take(limits.max_turn_count).enumerate() {
        for (column, text) in [(&mut *roles, &message.role), (&mut *contents, &message.content)] {
            let Some(slot) = column.get_mut(i * width..(i + 1) * width) else {
                return written;
            };
            let n = floor_char_boundary(text, width - 1);
            slot[..n].copy_from_slice(&text.as_bytes()[..n]);
            slot[n] = 0;
        }
        written += 1;
    }
    written
}

/// Largest byte length `<= max` that does not split a UTF-8 character.
fn floor_char_boundary(text: &str, max: usize) -> usize {
    if max >= text.len() {
        return text.len();
    }
    (0..=max).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0)
}

/// Reject an embedding result containing any NaN.
pub fn validate_embeddings(values: Vec<f32>) -> Option<Vec<f32>> {
    if values.iter().any(|v| v.is_nan()) {
        tracing::warn!(
            "Rejecting embedding of {} values: NaN in native output",
            values.len()
        );
        None
    } else {
        Some(values)
    }
}

/// Split a sequence into parallel role/content columns.
pub fn split_messages(messages: &MessageSequence) -> (Vec<String>, Vec<String>) {
    messages
        .iter()
        .map(|m| (m.role.clone(), m.content.clone()))
        .unzip()
}
