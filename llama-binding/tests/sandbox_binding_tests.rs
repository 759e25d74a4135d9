//! Sandboxed binding against an in-process module.
//!
//! `FakeModule` stands in for a wasm32 build of the backend: a byte-vector
//! linear memory with a bump allocator, exports that decode the packed
//! parameter blocks with 32-bit pointers, and callback ids raised through
//! the event sink exactly like the real module does.

use common::{
    EmbeddingParameters, GenerationConfig, InitializationParameters, LogLevel, LogSink, Message,
    MessageSequence, OptionalValue, SequenceLimits,
};
use llama_binding::ffi::{GENERATION_PARAMS, INIT_PARAMS};
use llama_binding::layout::{Abi, StructReader};
use llama_binding::marshal::write_message_columns;
use llama_binding::{EventSink, InferenceBackend, SandboxError, SandboxModule, SandboxedBinding};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Shared {
    live_blocks: BTreeSet<u32>,
    calls: Vec<String>,
    model_path: Option<String>,
    context_length: Option<OptionalValue<u32>>,
    threads: Option<OptionalValue<i32>>,
    sampler_chain: Vec<i32>,
    contexts: BTreeMap<String, Vec<(String, String)>>,
    embedding: Vec<f32>,
    /// Hold the done id instead of completing during the call
    defer_done: bool,
    /// Emit done twice, then a late token
    duplicate_done: bool,
    crash_on_generate: bool,
    held_done: Option<u32>,
}

struct FakeModule {
    memory: Vec<u8>,
    next: u32,
    shared: Arc<Mutex<Shared>>,
}

const MEMORY_BYTES: usize = 4 * 1024 * 1024;

impl FakeModule {
    fn new(shared: Arc<Mutex<Shared>>) -> Self {
        Self {
            memory: vec![0; MEMORY_BYTES],
            next: 8,
            shared,
        }
    }

    fn cstr(&self, ptr: i32) -> String {
        let start = ptr as usize;
        let end = self.memory[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|n| start + n)
            .unwrap();
        String::from_utf8_lossy(&self.memory[start..end]).into_owned()
    }

    fn word(&self, ptr: usize) -> u32 {
        u32::from_le_bytes(self.memory[ptr..ptr + 4].try_into().unwrap())
    }

    fn string_array(&self, ptr: i32, count: i32) -> Vec<String> {
        (0..count as usize)
            .map(|i| self.cstr(self.word(ptr as usize + i * 4) as i32))
            .collect()
    }

    fn turns(&self, key: &str) -> Option<Vec<(String, String)>> {
        self.shared.lock().unwrap().contexts.get(key).cloned()
    }

    fn export(&mut self, name: &str, args: &[i32], events: &EventSink) -> i32 {
        self.shared.lock().unwrap().calls.push(name.to_string());
        match name {
            "initialize_model" => {
                let size = INIT_PARAMS.size(Abi::Wasm32);
                let start = args[1] as usize;
                let block = self.memory[start..start + size].to_vec();
                let reader = StructReader::new(&INIT_PARAMS, Abi::Wasm32, &block);
                let path = self.cstr(reader.get_ptr("model_path").unwrap() as i32);
                let context = reader.nested("context").unwrap();

                let mut s = self.shared.lock().unwrap();
                s.model_path = Some(path);
                s.context_length = Some(context.get("context_length").unwrap());
                s.threads = Some(context.get("threads").unwrap());
                1
            }
            "init_context" => {
                let key = self.cstr(args[1]);
                let roles = self.string_array(args[2], args[4]);
                let contents = self.string_array(args[3], args[4]);
                let turns = roles.into_iter().zip(contents).collect();
                self.shared.lock().unwrap().contexts.insert(key, turns);
                1
            }
            "add_turn_to_context" => {
                let (key, role, content) = (self.cstr(args[0]), self.cstr(args[1]), self.cstr(args[2]));
                let mut s = self.shared.lock().unwrap();
                match s.contexts.get_mut(&key) {
                    Some(turns) => {
                        turns.push((role, content));
                        1
                    }
                    None => 0,
                }
            }
            "get_context" => {
                let Some(turns) = self.turns(&self.cstr(args[0])) else {
                    return -1;
                };
                let limits = SequenceLimits {
                    max_turn_count: args[3] as usize,
                    max_string_length: args[4] as usize,
                };
                let column = limits.column_bytes().unwrap();
                let messages: MessageSequence = turns
                    .into_iter()
                    .map(|(role, content)| Message::new(role, content))
                    .collect();
                let mut roles = vec![0u8; column];
                let mut contents = vec![0u8; column];
                let count = write_message_columns(&messages, &mut roles, &mut contents, limits);
                self.write(args[1] as u32, &roles).unwrap();
                self.write(args[2] as u32, &contents).unwrap();
                count as i32
            }
            "generate_response" => {
                let size = GENERATION_PARAMS.size(Abi::Wasm32);
                let start = args[3] as usize;
                let block = self.memory[start..start + size].to_vec();
                let reader = StructReader::new(&GENERATION_PARAMS, Abi::Wasm32, &block);
                let chain_ptr = reader.get_ptr("samplers").unwrap() as usize;
                let chain_len: i32 = reader.get("n_samplers").unwrap();
                let chain: Vec<i32> = (0..chain_len as usize)
                    .map(|i| self.word(chain_ptr + i * 4) as i32)
                    .collect();

                let (token_id, done_id) = (args[4] as u32, args[5] as u32);
                let (defer, duplicate, crash) = {
                    let mut s = self.shared.lock().unwrap();
                    s.sampler_chain = chain;
                    (s.defer_done, s.duplicate_done, s.crash_on_generate)
                };
                if crash {
                    panic!("module trapped");
                }
                events.emit_text(token_id, "Hel");
                events.emit_text(token_id, "lo");
                if defer {
                    self.shared.lock().unwrap().held_done = Some(done_id);
                    return 1;
                }
                events.emit_bool(done_id, true);
                if duplicate {
                    events.emit_bool(done_id, false);
                    events.emit_text(token_id, "late");
                }
                1
            }
            "abort_generation" => {
                if let Some(done_id) = self.shared.lock().unwrap().held_done.take() {
                    events.emit_bool(done_id, false);
                }
                0
            }
            "cache_context" => {
                events.log(1, &format!("cached {}", self.cstr(args[0])));
                1
            }
            "get_embeddings_size" => self.shared.lock().unwrap().embedding.len() as i32,
            "compute_embeddings" => {
                let values = self.shared.lock().unwrap().embedding.clone();
                let n = values.len().min(args[4] as usize);
                let bytes: Vec<u8> = values[..n].iter().flat_map(|v| v.to_le_bytes()).collect();
                self.write(args[3] as u32, &bytes).unwrap();
                n as i32
            }
            _ => 1,
        }
    }
}

impl SandboxModule for FakeModule {
    fn malloc(&mut self, size: u32) -> Result<u32, SandboxError> {
        let ptr = self.next;
        let end = (ptr + size + 7) & !7;
        if end as usize > self.memory.len() {
            return Ok(0);
        }
        self.next = end;
        self.shared.lock().unwrap().live_blocks.insert(ptr);
        Ok(ptr)
    }

    fn free(&mut self, ptr: u32) -> Result<(), SandboxError> {
        self.shared.lock().unwrap().live_blocks.remove(&ptr);
        Ok(())
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), SandboxError> {
        let start = ptr as usize;
        let target = self
            .memory
            .get_mut(start..start + bytes.len())
            .ok_or(SandboxError::MemoryOutOfBounds {
                ptr,
                len: bytes.len() as u32,
            })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
        let start = ptr as usize;
        self.memory
            .get(start..start + len as usize)
            .map(<[u8]>::to_vec)
            .ok_or(SandboxError::MemoryOutOfBounds { ptr, len })
    }

    fn call(&mut self, export: &str, args: &[i32], events: &EventSink) -> Result<i32, SandboxError> {
        Ok(self.export(export, args, events))
    }
}

fn sandbox() -> (SandboxedBinding, Arc<Mutex<Shared>>) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let module_state = shared.clone();
    let binding = SandboxedBinding::new(
        Arc::new(move || Ok(Box::new(FakeModule::new(module_state.clone())) as Box<dyn SandboxModule>)),
        false,
    );
    (binding, shared)
}

fn channel<T: Send + 'static>() -> (Box<dyn FnOnce(T) + Send>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel();
    (
        Box::new(move |value| {
            let _ = tx.send(value);
        }),
        rx,
    )
}

fn wait<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("completion never fired")
}

/// Round trip through the worker so every earlier request has been handled.
fn barrier(binding: &SandboxedBinding) {
    let (done, rx) = channel();
    binding.add_turn("barrier", "user", "-", done);
    wait(&rx);
}

fn token_sink() -> (common::TokenCallback, Arc<Mutex<Vec<String>>>) {
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let sink = tokens.clone();
    (
        Arc::new(move |token: &str| sink.lock().unwrap().push(token.to_string())),
        tokens,
    )
}

#[test]
fn test_optional_fields_survive_wasm32_packing() {
    println!("\n🧪 Testing InitParams packing into module memory...");

    let (binding, shared) = sandbox();
    let mut params = InitializationParameters::new("/models/tiny.gguf");
    params.context.context_length = OptionalValue::some(4096);
    params.context.threads = OptionalValue::none();

    let (done, rx) = channel();
    binding.initialize_model("model", &params, done);
    assert!(wait(&rx));

    let s = shared.lock().unwrap();
    assert_eq!(s.model_path.as_deref(), Some("/models/tiny.gguf"));
    assert_eq!(s.context_length, Some(OptionalValue::some(4096)));
    assert_eq!(s.threads, Some(OptionalValue::none()));
    assert_eq!(s.calls, vec!["initialize_model".to_string()]);
    assert!(s.live_blocks.is_empty(), "init scope must be released");

    println!("✅ context_length present, threads absent, no leaked blocks");
}

#[test]
fn test_context_round_trip_through_module_memory() {
    println!("\n🧪 Testing init_context / add_turn / get_context in the sandbox...");

    let (binding, shared) = sandbox();
    let mut seed = MessageSequence::new();
    seed.push("system", "You are terse.");
    seed.push("user", "Hi");

    let (done, rx) = channel();
    binding.init_context("model", "input", &seed, done);
    assert!(wait(&rx));

    let (done, rx) = channel();
    binding.add_turn("input", "assistant", "Hello", done);
    assert!(wait(&rx));

    let (done, rx) = channel();
    binding.get_context("input", SequenceLimits::default(), done);
    let messages = wait(&rx).expect("context should exist");
    assert_eq!(messages.len(), 3);
    assert_eq!(messages.last().unwrap(), &Message::new("assistant", "Hello"));

    let (done, rx) = channel();
    binding.get_context("missing", SequenceLimits::default(), done);
    assert_eq!(wait(&rx), None);

    assert!(shared.lock().unwrap().live_blocks.is_empty());
    println!("✅ {} turns read back", messages.len());
}

#[test]
fn test_generation_uses_two_ids_and_frees_scope_on_done() {
    println!("\n🧪 Testing deferred generation completion...");

    let (binding, shared) = sandbox();
    shared.lock().unwrap().defer_done = true;

    let (on_token, tokens) = token_sink();
    let (done, done_rx) = channel();
    binding.generate_response(
        "model",
        "input",
        "output",
        &GenerationConfig::default(),
        on_token,
        done,
    );

    barrier(&binding);
    assert_eq!(*tokens.lock().unwrap(), vec!["Hel", "lo"]);
    assert!(done_rx.try_recv().is_err(), "done must wait for the module");
    assert!(
        !shared.lock().unwrap().live_blocks.is_empty(),
        "generation scope stays alive until done"
    );
    assert_eq!(binding.pending_callbacks(), 2);

    binding.abort_generation("model");
    assert!(!wait(&done_rx));
    barrier(&binding);

    assert!(shared.lock().unwrap().live_blocks.is_empty());
    assert_eq!(binding.pending_callbacks(), 0);
    assert_eq!(
        shared.lock().unwrap().sampler_chain,
        GenerationConfig::default()
            .samplers
            .iter()
            .map(|s| s.tag())
            .collect::<Vec<_>>()
    );

    println!("✅ Token and done ids routed separately, scope freed after done");
}

#[test]
fn test_duplicate_and_late_replies_are_ignored() {
    println!("\n🧪 Testing stale callback ids...");

    let (binding, shared) = sandbox();
    shared.lock().unwrap().duplicate_done = true;

    let (on_token, tokens) = token_sink();
    let (tx, rx) = mpsc::channel();
    binding.generate_response(
        "model",
        "input",
        "output",
        &GenerationConfig::default(),
        on_token,
        Box::new(move |ok| tx.send(ok).unwrap()),
    );

    assert!(wait(&rx));
    barrier(&binding);
    assert!(rx.try_recv().is_err(), "done must fire exactly once");
    assert_eq!(*tokens.lock().unwrap(), vec!["Hel", "lo"]);
    assert_eq!(binding.pending_callbacks(), 0);

    println!("✅ Second done and late token dropped");
}

#[test]
fn test_nan_embedding_is_rejected() {
    let (binding, shared) = sandbox();
    let params = EmbeddingParameters {
        max_embedding_size: 16,
    };

    shared.lock().unwrap().embedding = vec![0.5, f32::NAN];
    let (done, rx) = channel();
    binding.compute_embeddings("model", "text", &params, done);
    assert_eq!(wait(&rx), None);

    shared.lock().unwrap().embedding = vec![0.5, -1.0];
    let (done, rx) = channel();
    binding.compute_embeddings("model", "text", &params, done);
    assert_eq!(wait(&rx), Some(vec![0.5, -1.0]));

    let (done, rx) = channel();
    binding.get_embeddings_size("model", done);
    assert_eq!(wait(&rx), Some(2));
}

#[test]
fn test_worker_crash_fails_pending_and_later_calls() {
    println!("\n🧪 Testing worker failure...");

    let (binding, shared) = sandbox();
    shared.lock().unwrap().crash_on_generate = true;

    let (on_token, _tokens) = token_sink();
    let (done, rx) = channel();
    binding.generate_response(
        "model",
        "input",
        "output",
        &GenerationConfig::default(),
        on_token,
        done,
    );
    assert!(!wait(&rx));

    let (done, rx) = channel();
    binding.add_turn("input", "user", "anyone there?", done);
    assert!(!wait(&rx));
    assert_eq!(binding.pending_callbacks(), 0);

    println!("✅ Pending generation and later calls completed with false");
}

#[derive(Default)]
struct CapturingSink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl LogSink for CapturingSink {
    fn log(&self, level: LogLevel, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

#[test]
fn test_module_log_lines_reach_the_configured_sink() {
    println!("\n🧪 Testing sandbox log forwarding...");

    let shared = Arc::new(Mutex::new(Shared::default()));
    let module_state = shared.clone();
    let sink = Arc::new(CapturingSink::default());
    let binding = SandboxedBinding::new(
        Arc::new(move || Ok(Box::new(FakeModule::new(module_state.clone())) as Box<dyn SandboxModule>)),
        true,
    )
    .with_log_sink(sink.clone());

    let (done, rx) = channel();
    binding.cache_context("input", done);
    assert!(wait(&rx));

    // The log reply was queued ahead of the completion
    assert_eq!(
        *sink.lines.lock().unwrap(),
        vec![(LogLevel::Info, "cached input".to_string())]
    );

    println!("✅ Module log line delivered to the sink");
}

#[test]
fn test_failed_module_start_reports_error() {
    let binding = SandboxedBinding::new(
        Arc::new(|| Err(SandboxError::ModuleUnavailable("no such module".into()))),
        false,
    );
    assert!(binding.ensure_loaded().is_err());

    let (done, rx) = channel();
    binding.cache_context("input", done);
    assert!(!wait(&rx));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replies_are_pumped_on_the_tokio_runtime() {
    let (binding, _shared) = sandbox();
    let mut seed = MessageSequence::new();
    seed.push("user", "Hi");

    let (tx, rx) = tokio::sync::oneshot::channel();
    binding.init_context(
        "model",
        "input",
        &seed,
        Box::new(move |ok| {
            let _ = tx.send(ok);
        }),
    );
    assert!(rx.await.unwrap());

    binding.free();
    assert_eq!(binding.state(), llama_binding::BindingState::Freed);
}
