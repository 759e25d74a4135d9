use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV_VAR: &str = "LLMBRIDGE_LOG";

/// Target used for lines forwarded from the inference backend.
pub const NATIVE_LOG_TARGET: &str = "llama_native";

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Integer levels as reported by the backend's log callback.
impl From<i32> for LogLevel {
    fn from(level: i32) -> Self {
        match level {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            3 => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Receives leveled log lines from the inference backend.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default sink: re-emits backend lines as `tracing` events under
/// [`NATIVE_LOG_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        forward_native(level, message);
    }
}

/// Emit one backend log line through `tracing`.
pub fn forward_native(level: LogLevel, message: &str) {
    // Backend lines usually carry their own newline
    let message = message.trim_end();
    if message.is_empty() {
        return;
    }
    match level {
        LogLevel::Debug => tracing::debug!(target: "llama_native", "{}", message),
        LogLevel::Info => tracing::info!(target: "llama_native", "{}", message),
        LogLevel::Warn => tracing::warn!(target: "llama_native", "{}", message),
        LogLevel::Error => tracing::error!(target: "llama_native", "{}", message),
    }
}

static INIT: Once = Once::new();

/// Install the global fmt subscriber.
///
/// `LLMBRIDGE_LOG` wins over `default_level` when set. Safe to call more
/// than once; only the first call has an effect.
pub fn init_tracing(default_level: &str, json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let result = if json {
            fmt().json().with_env_filter(filter).with_target(true).try_init()
        } else {
            fmt().with_env_filter(filter).with_target(true).try_init()
        };

        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}
