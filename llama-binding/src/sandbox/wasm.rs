//! wasmtime host for a wasm32 build of the backend.
//!
//! The module must export `memory`, `malloc(size) -> ptr`, `free(ptr)` and
//! the bridge exports with i32 arguments. It imports three host functions
//! from `env`:
//!
//! - `emit_bool(callback_id, value)`
//! - `emit_text(callback_id, ptr, len)`
//! - `log(level, ptr, len)`

use super::{EventSink, SandboxModule};
use crate::error::SandboxError;
use std::path::Path;
use tracing::{info, warn};
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc, Val};

#[derive(Default)]
struct HostState {
    /// Set for the duration of one export call
    events: Option<EventSink>,
}

pub struct WasmSandbox {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

fn unavailable(e: impl std::fmt::Display) -> SandboxError {
    SandboxError::ModuleUnavailable(e.to_string())
}

fn guest_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<String> {
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        warn!("Sandbox module has no memory export");
        return None;
    };
    let start = ptr as u32 as usize;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    match memory.data(&caller).get(start..end) {
        Some(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        None => {
            warn!("Sandbox string at {:#x}+{} is out of bounds", start, len);
            None
        }
    }
}

impl WasmSandbox {
    pub fn from_file(path: &Path) -> Result<Self, SandboxError> {
        info!("Loading sandbox module {}", path.display());
        let engine = Engine::default();
        let module = Module::from_file(&engine, path).map_err(unavailable)?;
        Self::instantiate(engine, module)
    }

    /// Module from wasm bytes (or text, with the `wat` feature).
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, SandboxError> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).map_err(unavailable)?;
        Self::instantiate(engine, module)
    }

    fn instantiate(engine: Engine, module: Module) -> Result<Self, SandboxError> {
        let mut linker: Linker<HostState> = Linker::new(&engine);
        linker
            .func_wrap(
                "env",
                "emit_bool",
                |caller: Caller<'_, HostState>, id: i32, value: i32| {
                    if let Some(events) = &caller.data().events {
                        events.emit_bool(id as u32, value != 0);
                    }
                },
            )
            .map_err(unavailable)?;
        linker
            .func_wrap(
                "env",
                "emit_text",
                |mut caller: Caller<'_, HostState>, id: i32, ptr: i32, len: i32| {
                    let Some(text) = guest_string(&mut caller, ptr, len) else {
                        return;
                    };
                    if let Some(events) = &caller.data().events {
                        events.emit_text(id as u32, &text);
                    }
                },
            )
            .map_err(unavailable)?;
        linker
            .func_wrap(
                "env",
                "log",
                |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                    let forward = caller
                        .data()
                        .events
                        .as_ref()
                        .is_some_and(EventSink::native_logging);
                    if !forward {
                        return;
                    }
                    let Some(message) = guest_string(&mut caller, ptr, len) else {
                        return;
                    };
                    if let Some(events) = &caller.data().events {
                        events.log(level, &message);
                    }
                },
            )
            .map_err(unavailable)?;

        let mut store = Store::new(&engine, HostState::default());
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(unavailable)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| SandboxError::MissingExport("memory".into()))?;
        let malloc = instance
            .get_typed_func::<i32, i32>(&mut store, "malloc")
            .map_err(|_| SandboxError::MissingExport("malloc".into()))?;
        let free = instance
            .get_typed_func::<i32, ()>(&mut store, "free")
            .map_err(|_| SandboxError::MissingExport("free".into()))?;

        Ok(Self {
            store,
            instance,
            memory,
            malloc,
            free,
        })
    }

    fn range(&self, ptr: u32, len: u32) -> Result<std::ops::Range<usize>, SandboxError> {
        let start = ptr as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end <= self.memory.data_size(&self.store))
            .ok_or(SandboxError::MemoryOutOfBounds { ptr, len })?;
        Ok(start..end)
    }
}

impl SandboxModule for WasmSandbox {
    fn malloc(&mut self, size: u32) -> Result<u32, SandboxError> {
        self.malloc
            .call(&mut self.store, size as i32)
            .map(|ptr| ptr as u32)
            .map_err(|e| SandboxError::Trap {
                export: "malloc".into(),
                message: e.to_string(),
            })
    }

    fn free(&mut self, ptr: u32) -> Result<(), SandboxError> {
        self.free
            .call(&mut self.store, ptr as i32)
            .map_err(|e| SandboxError::Trap {
                export: "free".into(),
                message: e.to_string(),
            })
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), SandboxError> {
        let len = u32::try_from(bytes.len()).map_err(|_| SandboxError::MemoryOutOfBounds {
            ptr,
            len: u32::MAX,
        })?;
        let range = self.range(ptr, len)?;
        self.memory.data_mut(&mut self.store)[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
        let range = self.range(ptr, len)?;
        Ok(self.memory.data(&self.store)[range].to_vec())
    }

    fn call(
        &mut self,
        export: &str,
        args: &[i32],
        events: &EventSink,
    ) -> Result<i32, SandboxError> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| SandboxError::MissingExport(export.to_string()))?;
        let params: Vec<Val> = args.iter().map(|arg| Val::I32(*arg)).collect();
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];

        self.store.data_mut().events = Some(events.clone());
        let outcome = func.call(&mut self.store, &params, &mut results);
        self.store.data_mut().events = None;

        outcome.map_err(|e| SandboxError::Trap {
            export: export.to_string(),
            message: e.to_string(),
        })?;
        Ok(results.first().and_then(Val::i32).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceBackend;
    use crate::sandbox::SandboxedBinding;
    use common::GenerationConfig;
    use std::sync::{mpsc, Arc};

    const ECHO_MODULE: &str = r#"
        (module
          (import "env" "emit_bool" (func $emit_bool (param i32 i32)))
          (import "env" "emit_text" (func $emit_text (param i32 i32 i32)))
          (import "env" "log" (func $log (param i32 i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 16) "hi")
          (global $next (mut i32) (i32.const 1024))
          (func (export "malloc") (param $size i32) (result i32)
            (local $ptr i32)
            global.get $next
            local.set $ptr
            global.get $next
            local.get $size
            i32.const 7
            i32.add
            i32.const -8
            i32.and
            i32.add
            global.set $next
            local.get $ptr)
          (func (export "free") (param i32))
          (func (export "add_turn_to_context") (param i32 i32 i32) (result i32)
            i32.const 1
            i32.const 16
            i32.const 2
            call $log
            i32.const 1)
          (func (export "generate_response") (param i32 i32 i32 i32 i32 i32) (result i32)
            local.get 4
            i32.const 16
            i32.const 2
            call $emit_text
            local.get 5
            i32.const 1
            call $emit_bool
            i32.const 1))
    "#;

    fn binding() -> SandboxedBinding {
        SandboxedBinding::new(
            Arc::new(|| {
                WasmSandbox::from_bytes(ECHO_MODULE)
                    .map(|module| Box::new(module) as Box<dyn SandboxModule>)
            }),
            true,
        )
    }

    #[test]
    fn test_memory_bounds_are_checked() {
        let mut sandbox = WasmSandbox::from_bytes(ECHO_MODULE).unwrap();
        let ptr = sandbox.malloc(4).unwrap();
        sandbox.write(ptr, &[1, 2, 3, 4]).unwrap();
        assert_eq!(sandbox.read(ptr, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            sandbox.read(65_534, 4),
            Err(SandboxError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_wasm_generation_streams_and_completes() {
        let binding = binding();
        binding.ensure_loaded().unwrap();

        let (tx, rx) = mpsc::channel();
        binding.add_turn("input", "user", "hello", Box::new(move |ok| tx.send(ok).unwrap()));
        assert!(rx.recv().unwrap());

        let (token_tx, token_rx) = mpsc::channel::<String>();
        let (done_tx, done_rx) = mpsc::channel();
        binding.generate_response(
            "model",
            "input",
            "output",
            &GenerationConfig::default(),
            Arc::new(move |token: &str| token_tx.send(token.to_string()).unwrap()),
            Box::new(move |ok| done_tx.send(ok).unwrap()),
        );
        assert!(done_rx.recv().unwrap());
        assert_eq!(token_rx.try_iter().collect::<Vec<_>>(), vec!["hi".to_string()]);
        assert_eq!(binding.pending_callbacks(), 0);
        binding.free();
    }
}
