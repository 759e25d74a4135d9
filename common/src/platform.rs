//! Filesystem locations used by the bridge.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Folder under `models_dir` holding content-addressed model files.
pub const MODELS_FOLDER: &str = "Models";

/// Per-user data directory for the bridge, falling back to the working
/// directory when the platform reports none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("llmbridge")
}

/// Lowercase hex SHA-256 of a model's source URL.
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic local path for the model downloaded from `url`:
/// `<models_dir>/Models/<sha256(url)>`.
pub fn model_path_for_url(models_dir: &Path, url: &str) -> PathBuf {
    models_dir.join(MODELS_FOLDER).join(url_hash(url))
}
