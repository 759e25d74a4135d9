//! Sandboxed binding: the backend compiled for a sandbox, driven through a
//! worker thread by JSON messages.
//!
//! ```text
//! SandboxedBinding ──WorkerRequest(JSON)──▶ worker thread ──i32 args──▶ SandboxModule
//!        ▲                                        │
//!        └──────── reply pump ◀──WorkerReply(JSON)┘ (EventSink)
//! ```
//!
//! Parameter blocks are packed with the same layout tables as the direct
//! binding, using 32-bit pointers, into blocks allocated inside the
//! module's linear memory.

pub mod allocator;
mod client;
pub mod protocol;
pub mod registry;
#[cfg(feature = "wasm-sandbox")]
pub mod wasm;
mod worker;

pub use allocator::{AllocationScope, TrackingAllocator};
pub use client::{ModuleFactory, SandboxedBinding};
pub use protocol::{CallbackId, WorkerReply, WorkerRequest};
pub use registry::{CallbackRegistry, ReplyHandler, Resolved};
#[cfg(feature = "wasm-sandbox")]
pub use wasm::WasmSandbox;

use crate::error::SandboxError;
use parking_lot::Mutex;
use protocol::{bool_result, floats_result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// A backend instance living in its own linear memory.
///
/// Exports take and return `i32`: pointers into the module's memory,
/// counts, and callback ids. Events raised during a call go to `events`.
pub trait SandboxModule {
    fn malloc(&mut self, size: u32) -> Result<u32, SandboxError>;
    fn free(&mut self, ptr: u32) -> Result<(), SandboxError>;
    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), SandboxError>;
    fn read(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, SandboxError>;
    fn call(&mut self, export: &str, args: &[i32], events: &EventSink)
        -> Result<i32, SandboxError>;
}

/// Outbound side of the reply channel, handed to the module during calls.
#[derive(Clone)]
pub struct EventSink {
    replies: UnboundedSender<String>,
    completed: Arc<Mutex<HashSet<CallbackId>>>,
    native_logging: bool,
}

impl EventSink {
    pub fn new(replies: UnboundedSender<String>, native_logging: bool) -> Self {
        Self {
            replies,
            completed: Arc::new(Mutex::new(HashSet::new())),
            native_logging,
        }
    }

    fn send(&self, reply: &WorkerReply) {
        match serde_json::to_string(reply) {
            Ok(json) => {
                if self.replies.send(json).is_err() {
                    debug!("Reply dropped: binding side is gone");
                }
            }
            Err(e) => tracing::error!("Failed to encode sandbox reply: {}", e),
        }
    }

    /// Terminal reply for `id`.
    pub fn emit(&self, id: CallbackId, result: Value) {
        self.completed.lock().insert(id);
        self.send(&WorkerReply::Callback {
            callback_id: id,
            result,
        });
    }

    pub fn emit_bool(&self, id: CallbackId, value: bool) {
        self.emit(id, bool_result(value));
    }

    pub fn emit_floats(&self, id: CallbackId, values: &[f32]) {
        self.emit(id, floats_result(values));
    }

    /// Failure reply; decodes as `false` / `None` for every shape.
    pub fn fail(&self, id: CallbackId) {
        self.emit(id, Value::Null);
    }

    /// Repeating text event (streamed tokens). Does not complete `id`.
    pub fn emit_text(&self, id: CallbackId, text: &str) {
        self.send(&WorkerReply::Callback {
            callback_id: id,
            result: Value::String(text.to_string()),
        });
    }

    /// Native log line; dropped unless forwarding was enabled at load.
    pub fn log(&self, level: i32, message: &str) {
        if self.native_logging {
            self.send(&WorkerReply::Log {
                level,
                message: message.to_string(),
            });
        }
    }

    pub fn native_logging(&self) -> bool {
        self.native_logging
    }

    pub fn is_completed(&self, id: CallbackId) -> bool {
        self.completed.lock().contains(&id)
    }

    /// Ids completed since the last drain.
    pub fn drain_completed(&self) -> HashSet<CallbackId> {
        std::mem::take(&mut *self.completed.lock())
    }
}
