//! Error types for the runtime layer

use std::path::PathBuf;
use thiserror::Error;

/// Why a model lifecycle ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Inference backend failed to load")]
    PluginInitialization,

    #[error("Model file {} could not be obtained", .0.display())]
    ModelUnavailable(PathBuf),

    #[error("Model '{0}' failed to initialize")]
    ModelInitialization(String),
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} while downloading {url}")]
    Status { url: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Destination {} has no parent directory", .0.display())]
    InvalidDestination(PathBuf),
}
