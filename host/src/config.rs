//! Command-line arguments and settings resolution for the host.
//!
//! Precedence, highest first: CLI flags, environment variables, the config
//! file, built-in defaults.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use common::{BackendKind, BridgeSettings, OptionalValue};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "llmbridge")]
#[command(about = "Chat with a local model through the inference bridge")]
#[command(version)]
pub struct CliArgs {
    /// Settings file (TOML or JSON, chosen by extension)
    #[arg(long, short = 'c', env = "LLMBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, env = "LLMBRIDGE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Download the model from this URL when it is not cached yet
    #[arg(long, env = "LLMBRIDGE_MODEL_URL")]
    pub model_url: Option<String>,

    /// Use a local model file instead of a cached download
    #[arg(long, env = "LLMBRIDGE_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Answer one prompt and exit instead of starting the chat loop
    #[arg(long, short = 'p')]
    pub prompt: Option<String>,

    /// System prompt seeding the conversation
    #[arg(long)]
    pub system: Option<String>,

    /// Binding variant
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Context window in tokens
    #[arg(long)]
    pub context_length: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Auto,
    Direct,
    Sandboxed,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Self::Auto,
            BackendArg::Direct => Self::Direct,
            BackendArg::Sandboxed => Self::Sandboxed,
        }
    }
}

impl CliArgs {
    /// File settings with the CLI overrides applied, validated.
    pub fn settings(&self) -> Result<BridgeSettings> {
        let mut settings = match &self.config {
            Some(path) => BridgeSettings::from_file(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => BridgeSettings::default(),
        };

        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(backend) = self.backend {
            settings.backend = backend.into();
        }

        settings.validate().context("invalid settings")?;
        Ok(settings)
    }

    pub fn context_length(&self) -> OptionalValue<u32> {
        self.context_length.into()
    }

    /// Either a URL or a path is needed to find the model.
    pub fn ensure_model_source(&self) -> Result<()> {
        if self.model_url.is_none() && self.model_path.is_none() {
            anyhow::bail!("pass --model-url or --model-path");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        let mut file_settings = BridgeSettings::default();
        file_settings.log_level = "warn".to_string();
        file_settings.max_turn_count = 16;
        file_settings.to_file(&path).unwrap();

        let args = CliArgs::parse_from([
            "llmbridge",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
            "--backend",
            "direct",
            "--model-path",
            "model.gguf",
        ]);
        let settings = args.settings().unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.backend, BackendKind::Direct);
        assert_eq!(settings.max_turn_count, 16);
        assert!(args.ensure_model_source().is_ok());
    }

    #[test]
    fn test_sandboxed_without_module_is_rejected() {
        let args = CliArgs::parse_from(["llmbridge", "--backend", "sandboxed"]);
        assert!(args.settings().is_err());
        assert!(args.ensure_model_source().is_err());
    }

    #[test]
    fn test_context_length_flag() {
        let args = CliArgs::parse_from(["llmbridge", "--context-length", "2048"]);
        assert_eq!(args.context_length(), OptionalValue::some(2048));
        let args = CliArgs::parse_from(["llmbridge"]);
        assert!(!args.context_length().has_value);
    }
}
