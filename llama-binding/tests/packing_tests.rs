//! Optional fields keep their presence bit and exact value through the
//! packed `InitParams` block, for both pointer widths.

use common::{ContextParameters, InitializationParameters, ModelParameters, OptionalValue};
use llama_binding::ffi::{InitParams, INIT_PARAMS};
use llama_binding::layout::{Abi, PointerAllocator, StructReader};
use llama_binding::marshal::{pack_init_params, CallArena};
use llama_binding::MarshalError;
use proptest::prelude::*;

const U32_FIELDS: [&str; 5] = [
    "context_length",
    "batch_size",
    "ubatch_size",
    "seq_max",
    "yarn_orig_ctx",
];
const I32_FIELDS: [&str; 5] = [
    "threads",
    "threads_batch",
    "rope_scaling_type",
    "pooling_type",
    "attention_type",
];
const F32_FIELDS: [&str; 7] = [
    "rope_freq_base",
    "rope_freq_scale",
    "yarn_ext_factor",
    "yarn_attn_factor",
    "yarn_beta_fast",
    "yarn_beta_slow",
    "defrag_threshold",
];
const BOOL_FIELDS: [&str; 3] = ["embeddings", "flash_attention", "enable_abort"];

const MODEL_I32_FIELDS: [&str; 3] = ["gpu_layers", "split_mode", "main_gpu"];
const MODEL_BOOL_FIELDS: [&str; 5] = [
    "use_mmap",
    "use_mlock",
    "vocab_only",
    "check_tensors",
    "enable_abort",
];

/// Bump allocator handing out 32-bit addresses, like module memory.
struct LinearMemory {
    next: u64,
}

impl PointerAllocator for LinearMemory {
    fn abi(&self) -> Abi {
        Abi::Wasm32
    }

    fn alloc(&mut self, bytes: &[u8], align: usize) -> Result<u64, MarshalError> {
        let align = align.max(1) as u64;
        let address = self.next.div_ceil(align) * align;
        self.next = address + bytes.len() as u64;
        Ok(address)
    }
}

#[derive(Debug, Clone)]
struct Fields {
    u32s: [Option<u32>; 5],
    i32s: [Option<i32>; 5],
    f32_bits: [Option<u32>; 7],
    bools: [Option<bool>; 3],
    model_i32s: [Option<i32>; 3],
    model_bools: [Option<bool>; 5],
}

impl Fields {
    fn params(&self) -> InitializationParameters {
        let f = |i: usize| -> OptionalValue<f32> {
            self.f32_bits[i].map(f32::from_bits).into()
        };
        let mut params = InitializationParameters::new("/models/any.gguf");
        params.context = ContextParameters {
            context_length: self.u32s[0].into(),
            batch_size: self.u32s[1].into(),
            ubatch_size: self.u32s[2].into(),
            seq_max: self.u32s[3].into(),
            yarn_orig_ctx: self.u32s[4].into(),
            threads: self.i32s[0].into(),
            threads_batch: self.i32s[1].into(),
            rope_scaling_type: self.i32s[2].into(),
            pooling_type: self.i32s[3].into(),
            attention_type: self.i32s[4].into(),
            rope_freq_base: f(0),
            rope_freq_scale: f(1),
            yarn_ext_factor: f(2),
            yarn_attn_factor: f(3),
            yarn_beta_fast: f(4),
            yarn_beta_slow: f(5),
            defrag_threshold: f(6),
            embeddings: self.bools[0].into(),
            flash_attention: self.bools[1].into(),
            enable_abort: self.bools[2].into(),
        };
        params.model = ModelParameters {
            gpu_layers: self.model_i32s[0].into(),
            split_mode: self.model_i32s[1].into(),
            main_gpu: self.model_i32s[2].into(),
            use_mmap: self.model_bools[0].into(),
            use_mlock: self.model_bools[1].into(),
            vocab_only: self.model_bools[2].into(),
            check_tensors: self.model_bools[3].into(),
            enable_abort: self.model_bools[4].into(),
        };
        params
    }

    /// Compare every field read back from `reader` against the input.
    fn check(&self, reader: &StructReader<'_>) -> Result<(), TestCaseError> {
        let context = reader.nested("context").unwrap();
        for (name, expected) in U32_FIELDS.iter().zip(self.u32s) {
            let got: OptionalValue<u32> = context.get(name).unwrap();
            prop_assert_eq!(got.into_option(), expected, "{}", name);
        }
        for (name, expected) in I32_FIELDS.iter().zip(self.i32s) {
            let got: OptionalValue<i32> = context.get(name).unwrap();
            prop_assert_eq!(got.into_option(), expected, "{}", name);
        }
        for (name, expected) in F32_FIELDS.iter().zip(self.f32_bits) {
            let got: OptionalValue<f32> = context.get(name).unwrap();
            prop_assert_eq!(got.into_option().map(f32::to_bits), expected, "{}", name);
        }
        for (name, expected) in BOOL_FIELDS.iter().zip(self.bools) {
            let got: OptionalValue<bool> = context.get(name).unwrap();
            prop_assert_eq!(got.into_option(), expected, "{}", name);
        }

        let model = reader.nested("model").unwrap();
        for (name, expected) in MODEL_I32_FIELDS.iter().zip(self.model_i32s) {
            let got: OptionalValue<i32> = model.get(name).unwrap();
            prop_assert_eq!(got.into_option(), expected, "model.{}", name);
        }
        for (name, expected) in MODEL_BOOL_FIELDS.iter().zip(self.model_bools) {
            let got: OptionalValue<bool> = model.get(name).unwrap();
            prop_assert_eq!(got.into_option(), expected, "model.{}", name);
        }
        Ok(())
    }
}

// Zero values are drawn often: present-and-zero must not read back as absent
fn u32_value() -> impl Strategy<Value = Option<u32>> {
    proptest::option::of(prop_oneof![Just(0u32), any::<u32>()])
}

fn i32_value() -> impl Strategy<Value = Option<i32>> {
    proptest::option::of(prop_oneof![Just(0i32), any::<i32>()])
}

fn f32_bits() -> impl Strategy<Value = Option<u32>> {
    proptest::option::of(prop_oneof![
        Just(0.0f32.to_bits()),
        Just((-0.0f32).to_bits()),
        any::<u32>(),
    ])
}

fn fields() -> impl Strategy<Value = Fields> {
    (
        proptest::array::uniform5(u32_value()),
        proptest::array::uniform5(i32_value()),
        proptest::array::uniform7(f32_bits()),
        proptest::array::uniform3(proptest::option::of(any::<bool>())),
        proptest::array::uniform3(i32_value()),
        proptest::array::uniform5(proptest::option::of(any::<bool>())),
    )
        .prop_map(|(u32s, i32s, f32_bits, bools, model_i32s, model_bools)| Fields {
            u32s,
            i32s,
            f32_bits,
            bools,
            model_i32s,
            model_bools,
        })
}

proptest! {
    #[test]
    fn prop_optionals_survive_host_packing(fields in fields()) {
        let mut arena = CallArena::new();
        let packed = pack_init_params(&fields.params(), &mut arena).unwrap();
        fields.check(&packed.reader())?;

        // The #[repr(C)] view the backend receives agrees with the table
        // SAFETY: host-ABI buffer built from the InitParams table.
        let native: &InitParams = unsafe { &*packed.as_native_ptr::<InitParams>() };
        prop_assert_eq!(
            native.context.context_length.has_value,
            fields.u32s[0].is_some()
        );
        prop_assert_eq!(
            native.context.rope_freq_base.into_option().map(f32::to_bits),
            fields.f32_bits[0]
        );
        prop_assert_eq!(native.model.use_mmap.into_option(), fields.model_bools[0]);
    }

    #[test]
    fn prop_optionals_survive_wasm32_packing(fields in fields()) {
        let mut memory = LinearMemory { next: 8 };
        let packed = pack_init_params(&fields.params(), &mut memory).unwrap();
        prop_assert_eq!(packed.bytes().len(), INIT_PARAMS.size(Abi::Wasm32));

        // Read from a copy, as the module sees it after the write
        let bytes = packed.bytes().to_vec();
        fields.check(&StructReader::new(&INIT_PARAMS, Abi::Wasm32, &bytes))?;
    }
}

#[test]
fn test_zero_values_stay_present() {
    println!("\n🧪 Testing present zero values through both ABIs...");

    let fields = Fields {
        u32s: [Some(0); 5],
        i32s: [Some(0); 5],
        f32_bits: [Some((-0.0f32).to_bits()); 7],
        bools: [Some(false); 3],
        model_i32s: [Some(0); 3],
        model_bools: [Some(false); 5],
    };

    let mut arena = CallArena::new();
    let host = pack_init_params(&fields.params(), &mut arena).unwrap();
    fields.check(&host.reader()).unwrap();

    let mut memory = LinearMemory { next: 8 };
    let wasm = pack_init_params(&fields.params(), &mut memory).unwrap();
    fields.check(&wasm.reader()).unwrap();

    println!("✅ 0, -0.0 and false read back as present");
}
