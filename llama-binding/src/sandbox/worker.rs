//! Worker thread hosting the sandbox module.
//!
//! Requests are handled one at a time in arrival order. Each one is
//! marshaled into module memory through a [`TrackingAllocator`], the export
//! is called, output is read back and a reply is emitted. Generation scopes
//! stay alive until their done id has been emitted, which may happen during
//! a later call.

use super::allocator::{as_arg, AllocationScope, TrackingAllocator};
use super::protocol::{CallbackId, WorkerRequest};
use super::{EventSink, SandboxModule};
use crate::error::{MarshalError, SandboxError};
use crate::layout::{Abi, PackedStruct, PointerAllocator};
use crate::marshal::{
    pack_embedding_params, pack_generation_params, pack_init_params, read_message_columns,
    split_messages,
};
use serde_json::Value;
use std::sync::mpsc::{Receiver, Sender};
use tracing::{debug, error, info, warn};

pub(crate) type ModuleResult = Result<Box<dyn SandboxModule>, SandboxError>;

pub(crate) enum WorkerMessage {
    Request(String),
    Terminate,
}

pub(crate) struct Worker {
    module: Box<dyn SandboxModule>,
    events: EventSink,
    pending_scopes: Vec<(CallbackId, AllocationScope)>,
}

/// Thread body: build the module, report readiness, then serve requests
/// until terminated or the binding side hangs up.
pub(crate) fn run<F>(
    create: F,
    events: EventSink,
    requests: Receiver<WorkerMessage>,
    ready: Sender<Result<(), SandboxError>>,
) where
    F: FnOnce() -> ModuleResult,
{
    let module = match create() {
        Ok(module) => module,
        Err(e) => {
            error!("Sandbox module failed to start: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    info!("Sandbox worker started");

    let mut worker = Worker {
        module,
        events,
        pending_scopes: Vec::new(),
    };
    while let Ok(message) = requests.recv() {
        match message {
            WorkerMessage::Request(json) => worker.handle_json(&json),
            WorkerMessage::Terminate => break,
        }
    }
    worker.shutdown();
    info!("Sandbox worker stopped");
}

impl Worker {
    fn handle_json(&mut self, json: &str) {
        match serde_json::from_str::<WorkerRequest>(json) {
            Ok(request) => self.handle(request),
            Err(e) => {
                error!("Malformed sandbox request: {}", e);
                // Answer the caller if the id is at least readable
                let id = serde_json::from_str::<Value>(json).ok().and_then(|v| {
                    v.get("callbackId")
                        .or_else(|| v.get("doneCallbackId"))
                        .and_then(Value::as_u64)
                });
                if let Some(id) = id.and_then(|id| CallbackId::try_from(id).ok()) {
                    self.events.fail(id);
                }
            }
        }
    }

    fn handle(&mut self, request: WorkerRequest) {
        let event = request.event();
        let completion = request.completion_id();
        debug!("Sandbox request {}", event);

        if let Err(e) = self.dispatch(request) {
            error!("{} failed in sandbox: {}", event, e);
            if let Some(id) = completion {
                if !self.events.is_completed(id) {
                    self.events.fail(id);
                }
            }
        }
        self.release_finished_scopes();
    }

    fn release_finished_scopes(&mut self) {
        let completed = self.events.drain_completed();
        if self.pending_scopes.is_empty() {
            return;
        }
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_scopes)
            .into_iter()
            .partition(|(id, _)| completed.contains(id));
        self.pending_scopes = pending;
        for (id, scope) in done {
            debug!("Releasing {} blocks for generation {:#x}", scope.len(), id);
            scope.release(self.module.as_mut());
        }
    }

    fn shutdown(&mut self) {
        for (id, scope) in std::mem::take(&mut self.pending_scopes) {
            warn!("Generation {:#x} still pending at shutdown", id);
            self.events.fail(id);
            scope.release(self.module.as_mut());
        }
    }

    /// Run `build` against a fresh tracking allocator; on error everything
    /// it allocated is freed.
    fn marshal<F>(&mut self, build: F) -> Result<(Vec<i32>, AllocationScope), SandboxError>
    where
        F: FnOnce(&mut TrackingAllocator<'_>) -> Result<Vec<i32>, SandboxError>,
    {
        let mut alloc = TrackingAllocator::new(self.module.as_mut());
        match build(&mut alloc) {
            Ok(args) => Ok((args, alloc.finish())),
            Err(e) => {
                alloc.abandon();
                Err(e)
            }
        }
    }

    /// Call an export and free its scope right after.
    fn call_scoped(
        &mut self,
        export: &str,
        args: &[i32],
        scope: AllocationScope,
    ) -> Result<i32, SandboxError> {
        let result = self.module.call(export, args, &self.events);
        scope.release(self.module.as_mut());
        result
    }

    /// Export taking only strings and answering a bool.
    fn call_bool(
        &mut self,
        id: CallbackId,
        export: &str,
        strings: &[&str],
    ) -> Result<(), SandboxError> {
        let (args, scope) = self.marshal(|a| {
            strings
                .iter()
                .map(|s| a.cstr(s).map_err(SandboxError::from))
                .collect()
        })?;
        let ok = self.call_scoped(export, &args, scope)? != 0;
        self.events.emit_bool(id, ok);
        Ok(())
    }

    fn call_void(&mut self, export: &str, model_id: &str) -> Result<(), SandboxError> {
        let (args, scope) = self.marshal(|a| Ok(vec![a.cstr(model_id)?]))?;
        self.call_scoped(export, &args, scope).map(|_| ())
    }

    fn read_floats(&mut self, ptr: i32, count: usize) -> Result<Vec<f32>, SandboxError> {
        let len = u32::try_from(count * 4).map_err(|_| SandboxError::MemoryOutOfBounds {
            ptr: ptr as u32,
            len: u32::MAX,
        })?;
        let bytes = self.module.read(ptr as u32, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Export writing up to `capacity` floats into a caller buffer.
    fn call_floats(
        &mut self,
        export: &str,
        mut args: Vec<i32>,
        scope: AllocationScope,
        out: i32,
        capacity: usize,
    ) -> Result<Option<Vec<f32>>, SandboxError> {
        let Ok(capacity_arg) = i32::try_from(capacity) else {
            scope.release(self.module.as_mut());
            return Err(MarshalError::ArrayTooLong { len: capacity }.into());
        };
        args.push(out);
        args.push(capacity_arg);
        let result = self.module.call(export, &args, &self.events);
        let values = match result {
            Ok(written) if written > 0 && written as usize <= capacity => {
                self.read_floats(out, written as usize).map(Some)
            }
            Ok(written) => {
                debug!("{} wrote {} of {} values", export, written, capacity);
                Ok(None)
            }
            Err(e) => Err(e),
        };
        scope.release(self.module.as_mut());
        values
    }

    fn dispatch(&mut self, request: WorkerRequest) -> Result<(), SandboxError> {
        match request {
            WorkerRequest::InitializeModel {
                callback_id,
                model_id,
                params,
            } => {
                let (args, scope) = self.marshal(|a| {
                    let id = a.cstr(&model_id)?;
                    let packed = pack_init_params(&params, a)?;
                    Ok(vec![id, place(a, &packed)?])
                })?;
                let ok = self.call_scoped("initialize_model", &args, scope)? != 0;
                info!("Sandbox model '{}' initialized: {}", model_id, ok);
                self.events.emit_bool(callback_id, ok);
            }
            WorkerRequest::ShutdownModel {
                callback_id,
                model_id,
            } => self.call_bool(callback_id, "shutdown_model", &[&model_id])?,
            WorkerRequest::AbortInitializeModel { model_id } => {
                self.call_void("abort_initialize_model", &model_id)?
            }

            WorkerRequest::InitContext {
                callback_id,
                model_id,
                key,
                messages,
            } => {
                let (roles, contents) = split_messages(&messages);
                let (args, scope) = self.marshal(|a| {
                    let count = i32::try_from(roles.len()).map_err(|_| {
                        MarshalError::ArrayTooLong { len: roles.len() }
                    })?;
                    Ok(vec![
                        a.cstr(&model_id)?,
                        a.cstr(&key)?,
                        as_arg(a.alloc_str_array(&roles)?),
                        as_arg(a.alloc_str_array(&contents)?),
                        count,
                    ])
                })?;
                let ok = self.call_scoped("init_context", &args, scope)? != 0;
                self.events.emit_bool(callback_id, ok);
            }
            WorkerRequest::GetContext {
                callback_id,
                key,
                limits,
            } => {
                let column = limits.column_bytes().ok_or(
                    MarshalError::ArrayTooLong {
                        len: limits.max_turn_count,
                    },
                )?;
                let column_len = u32::try_from(column)
                    .map_err(|_| MarshalError::ArrayTooLong { len: column })?;
                let max_turns = i32::try_from(limits.max_turn_count).map_err(|_| {
                    MarshalError::ArrayTooLong {
                        len: limits.max_turn_count,
                    }
                })?;
                let max_len = i32::try_from(limits.max_string_length).map_err(|_| {
                    MarshalError::ArrayTooLong {
                        len: limits.max_string_length,
                    }
                })?;
                let (args, scope) = self.marshal(|a| {
                    Ok(vec![
                        a.cstr(&key)?,
                        a.buffer(column)?,
                        a.buffer(column)?,
                        max_turns,
                        max_len,
                    ])
                })?;
                let result = self.module.call("get_context", &args, &self.events);
                let messages = match result {
                    Ok(count) if count >= 0 => {
                        let roles = self.module.read(args[1] as u32, column_len);
                        let contents = self.module.read(args[2] as u32, column_len);
                        match (roles, contents) {
                            (Ok(roles), Ok(contents)) => {
                                read_message_columns(&roles, &contents, count, limits)
                                    .map(Some)
                                    .map_err(SandboxError::from)
                            }
                            (Err(e), _) | (_, Err(e)) => Err(e),
                        }
                    }
                    Ok(_) => Ok(None),
                    Err(e) => Err(e),
                };
                scope.release(self.module.as_mut());
                match messages? {
                    Some(messages) => self.events.emit(callback_id, serde_json::to_value(messages)?),
                    None => self.events.fail(callback_id),
                }
            }
            WorkerRequest::AddTurn {
                callback_id,
                key,
                role,
                content,
            } => self.call_bool(callback_id, "add_turn_to_context", &[&key, &role, &content])?,
            WorkerRequest::AppendToContext {
                callback_id,
                key,
                content,
            } => self.call_bool(callback_id, "append_to_context", &[&key, &content])?,
            WorkerRequest::CopyContext {
                callback_id,
                source_key,
                destination_key,
            } => self.call_bool(callback_id, "copy_context", &[&source_key, &destination_key])?,
            WorkerRequest::FreeContext { callback_id, key } => {
                self.call_bool(callback_id, "free_context", &[&key])?
            }
            WorkerRequest::UnloadActiveContext {
                callback_id,
                model_id,
            } => self.call_bool(callback_id, "unload_active_context", &[&model_id])?,
            WorkerRequest::CacheContext { callback_id, key } => {
                self.call_bool(callback_id, "cache_context", &[&key])?
            }
            WorkerRequest::LoadContext {
                callback_id,
                model_id,
                key,
            } => self.call_bool(callback_id, "load_context", &[&model_id, &key])?,

            WorkerRequest::GenerateResponse {
                token_callback_id,
                done_callback_id,
                model_id,
                input_key,
                output_key,
                config,
            } => {
                let (args, scope) = self.marshal(|a| {
                    let model = a.cstr(&model_id)?;
                    let input = a.cstr(&input_key)?;
                    let output = a.cstr(&output_key)?;
                    let packed = pack_generation_params(&config, a)?;
                    Ok(vec![
                        model,
                        input,
                        output,
                        place(a, &packed)?,
                        token_callback_id as i32,
                        done_callback_id as i32,
                    ])
                })?;
                let started = self.module.call("generate_response", &args, &self.events);
                match started {
                    Ok(0) => {
                        if !self.events.is_completed(done_callback_id) {
                            self.events.emit_bool(done_callback_id, false);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("generate_response failed in sandbox: {}", e);
                        if !self.events.is_completed(done_callback_id) {
                            self.events.emit_bool(done_callback_id, false);
                        }
                    }
                }
                if self.events.is_completed(done_callback_id) {
                    scope.release(self.module.as_mut());
                } else {
                    self.pending_scopes.push((done_callback_id, scope));
                }
            }
            WorkerRequest::AbortGeneration { model_id } => {
                self.call_void("abort_generation", &model_id)?
            }

            WorkerRequest::GetEmbeddingsSize {
                callback_id,
                model_id,
            } => {
                let (args, scope) = self.marshal(|a| Ok(vec![a.cstr(&model_id)?]))?;
                let size = self.call_scoped("get_embeddings_size", &args, scope)?;
                if size >= 0 {
                    self.events.emit(callback_id, Value::from(size));
                } else {
                    self.events.fail(callback_id);
                }
            }
            WorkerRequest::ComputeEmbeddings {
                callback_id,
                model_id,
                text,
                params,
            } => {
                let capacity = params.max_embedding_size as usize;
                let (args, scope) = self.marshal(|a| {
                    let packed = pack_embedding_params(&params, Abi::Wasm32)?;
                    Ok(vec![
                        a.cstr(&model_id)?,
                        a.cstr(&text)?,
                        place(a, &packed)?,
                        a.buffer(capacity * 4)?,
                    ])
                })?;
                let out = args[3];
                let values =
                    self.call_floats("compute_embeddings", args[..3].to_vec(), scope, out, capacity)?;
                match values {
                    Some(values) => self.events.emit_floats(callback_id, &values),
                    None => self.events.fail(callback_id),
                }
            }

            WorkerRequest::LoadTts {
                callback_id,
                model_id,
                path,
            } => self.call_bool(callback_id, "load_tts", &[&model_id, &path])?,
            WorkerRequest::GenerateTts {
                callback_id,
                model_id,
                text,
                max_samples,
            } => {
                let capacity = max_samples as usize;
                let (args, scope) = self.marshal(|a| {
                    Ok(vec![
                        a.cstr(&model_id)?,
                        a.cstr(&text)?,
                        a.buffer(capacity * 4)?,
                    ])
                })?;
                let out = args[2];
                let samples =
                    self.call_floats("generate_tts", args[..2].to_vec(), scope, out, capacity)?;
                match samples {
                    Some(samples) => self.events.emit_floats(callback_id, &samples),
                    None => self.events.fail(callback_id),
                }
            }
            WorkerRequest::UnloadTts {
                callback_id,
                model_id,
            } => self.call_bool(callback_id, "unload_tts", &[&model_id])?,
        }
        Ok(())
    }
}

/// Copy a packed block into module memory, returning its address.
fn place(alloc: &mut TrackingAllocator<'_>, packed: &PackedStruct) -> Result<i32, SandboxError> {
    Ok(as_arg(alloc.alloc(packed.bytes(), packed.align())?))
}
