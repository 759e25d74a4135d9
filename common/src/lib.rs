//! Common types shared across the LLMBridge crates.
//!
//! This crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Defines the parameter data model that crosses the native boundary
//! - Owns settings, logging setup and platform path helpers
//!
//! # Architecture
//!
//! ```text
//! host (CLI)
//!    ↓
//! runtime  (runtime handle, sessions, staged lifecycle)
//!    ↓
//! llama-binding  (direct + sandboxed bindings)   task-scheduler (queue, retry)
//!    ↓                                              ↓
//! common  (this crate)
//! ```

pub mod logging;
pub mod messages;
pub mod optional;
pub mod params;
pub mod platform;
pub mod settings;

use std::sync::Arc;

pub use logging::{LogLevel, LogSink, TracingSink};
pub use messages::{Message, MessageSequence, SequenceLimits};
pub use optional::OptionalValue;
pub use params::{
    ContextParameters, EmbeddingParameters, GenerationConfig, InitializationParameters,
    ModelParameters, ParameterError, SamplerParameters, SamplerType,
};
pub use settings::{BackendKind, BridgeSettings, ConfigError, RetryBudget, RetryConfig};

/// One-shot completion callback used throughout the async plumbing.
///
/// Every operation that crosses the binding boundary reports its result
/// through exactly one invocation of a `Completion`.
pub type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Repeating callback receiving streamed tokens.
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Conventional key of the session that holds the conversation fed to the model.
pub const DEFAULT_INPUT_CONTEXT: &str = "input";

/// Conventional key of the session the model writes its reply into.
pub const DEFAULT_OUTPUT_CONTEXT: &str = "output";

/// Run a caller-supplied callback, logging instead of propagating a panic.
///
/// Returns `false` when the callback panicked.
pub fn invoke_guarded<F: FnOnce()>(label: &str, f: F) -> bool {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!("Callback '{}' panicked: {}", label, message);
            false
        }
    }
}
