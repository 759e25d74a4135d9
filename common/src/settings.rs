//! Bridge configuration.
//!
//! Loaded once at startup from TOML or JSON (chosen by file extension).
//! Every field has a default so partial files are accepted.

use crate::messages::SequenceLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid setting '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Which binding variant to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Sandboxed on `wasm32`, direct everywhere else
    #[default]
    Auto,
    Direct,
    Sandboxed,
}

impl BackendKind {
    /// Resolve `Auto` against the compilation target.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if cfg!(target_arch = "wasm32") => Self::Sandboxed,
            Self::Auto => Self::Direct,
            other => other,
        }
    }
}

/// Retry budget: a bounded number of retries, or none at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetryBudgetRepr", into = "RetryBudgetRepr")]
pub enum RetryBudget {
    Limited(u32),
    Infinite,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetryBudgetRepr {
    Count(u32),
    Word(String),
}

impl TryFrom<RetryBudgetRepr> for RetryBudget {
    type Error = String;

    fn try_from(repr: RetryBudgetRepr) -> Result<Self, Self::Error> {
        match repr {
            RetryBudgetRepr::Count(n) => Ok(Self::Limited(n)),
            RetryBudgetRepr::Word(w) if w.eq_ignore_ascii_case("infinite") => Ok(Self::Infinite),
            RetryBudgetRepr::Word(w) => Err(format!(
                "expected a retry count or \"infinite\", got \"{}\"",
                w
            )),
        }
    }
}

impl From<RetryBudget> for RetryBudgetRepr {
    fn from(budget: RetryBudget) -> Self {
        match budget {
            RetryBudget::Limited(n) => Self::Count(n),
            RetryBudget::Infinite => Self::Word("infinite".to_string()),
        }
    }
}

/// Exponential backoff configuration for the retry driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: RetryBudget,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Ceiling applied to the computed delay
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: RetryBudget::Limited(3),
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: Some(30_000),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows the `failures`-th failed attempt.
    ///
    /// `delay_ms × backoff_multiplier^(failures-1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        let raw = self.delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = match self.max_delay_ms {
            Some(max) => raw.min(max as f64),
            None => raw,
        };
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped / 1000.0)
        } else {
            Duration::ZERO
        }
    }

    /// Whether the retry budget is spent after `failures` failed attempts.
    pub fn exhausted(&self, failures: u32) -> bool {
        match self.max_retries {
            RetryBudget::Infinite => false,
            RetryBudget::Limited(max) => failures > max,
        }
    }
}

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Forward backend log lines into `tracing`. Read once at binding-load time.
    pub native_logging: bool,

    /// Log filter for the host (trace, debug, info, warn, error)
    pub log_level: String,

    /// Root of the per-platform native library folders
    pub library_dir: PathBuf,

    /// Root under which `Models/<hash>` files live
    pub models_dir: PathBuf,

    pub backend: BackendKind,

    /// Sandbox-compiled backend module (used by the sandboxed binding)
    pub sandbox_module: Option<PathBuf>,

    pub retry: RetryConfig,

    /// Force-advance a session queue whose current operation has not
    /// completed within this many milliseconds. `None` disables the watchdog.
    pub queue_stall_timeout_ms: Option<u64>,

    pub max_turn_count: usize,
    pub max_string_length: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let limits = SequenceLimits::default();
        let base = crate::platform::default_data_dir();
        Self {
            native_logging: false,
            log_level: "info".to_string(),
            library_dir: base.join("libs"),
            models_dir: base,
            backend: BackendKind::Auto,
            sandbox_module: None,
            retry: RetryConfig::default(),
            queue_stall_timeout_ms: Some(300_000),
            max_turn_count: limits.max_turn_count,
            max_string_length: limits.max_string_length,
        }
    }
}

impl BridgeSettings {
    /// Load settings from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let settings = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        Ok(settings)
    }

    /// Save settings to a file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();

        let content = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turn_count == 0 {
            return Err(ConfigError::invalid("max_turn_count", "must be greater than 0"));
        }

        if self.max_string_length < 2 {
            return Err(ConfigError::invalid(
                "max_string_length",
                "must leave room for at least one byte and the terminator",
            ));
        }

        if self.sequence_limits().column_bytes().is_none() {
            return Err(ConfigError::invalid(
                "max_turn_count",
                "max_turn_count × max_string_length overflows",
            ));
        }

        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                "must be a finite number >= 1.0",
            ));
        }

        if self.queue_stall_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "queue_stall_timeout_ms",
                "use no value to disable the watchdog, not 0",
            ));
        }

        if self.backend.resolve() == BackendKind::Sandboxed && self.sandbox_module.is_none() {
            return Err(ConfigError::invalid(
                "sandbox_module",
                "required when the sandboxed backend is selected",
            ));
        }

        Ok(())
    }

    pub fn sequence_limits(&self) -> SequenceLimits {
        SequenceLimits {
            max_turn_count: self.max_turn_count,
            max_string_length: self.max_string_length,
        }
    }

    pub fn queue_stall_timeout(&self) -> Option<Duration> {
        self.queue_stall_timeout_ms.map(Duration::from_millis)
    }
}
