//! Error types for loading and calling the inference backend

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BindingError>;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Library not found: {}", .0.display())]
    LibraryNotFound(PathBuf),

    /// The file exists but the loader refused it, which usually means one
    /// of its own dependencies is missing.
    #[error("Broken dependency chain while loading {}: {message}", .path.display())]
    BrokenDependencyChain { path: PathBuf, message: String },

    #[error("Missing symbol '{symbol}': {message}")]
    MissingSymbol { symbol: &'static str, message: String },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Binding has been freed")]
    Freed,

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Marshaling error: {0}")]
    Marshal(#[from] MarshalError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("String contains an interior NUL byte: {0:?}")]
    InteriorNul(String),

    #[error("String of {len} bytes exceeds the {max}-byte limit")]
    StringTooLong { len: usize, max: usize },

    #[error("Array of {len} elements is too long")]
    ArrayTooLong { len: usize },

    #[error("{structure} has no field '{field}'")]
    UnknownField { structure: &'static str, field: String },

    #[error("{structure}.{field} is {expected}, not {found}")]
    FieldKind {
        structure: &'static str,
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Access of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },

    #[error("Allocation failed: {0}")]
    Allocation(String),
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox module unavailable: {0}")]
    ModuleUnavailable(String),

    #[error("Sandbox export '{0}' not found")]
    MissingExport(String),

    #[error("Sandbox trapped in '{export}': {message}")]
    Trap { export: String, message: String },

    #[error("Sandbox memory access out of bounds: {len} bytes at {ptr:#x}")]
    MemoryOutOfBounds { ptr: u32, len: u32 },

    #[error("Sandbox worker is not running")]
    WorkerGone,

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Marshaling error: {0}")]
    Marshal(#[from] MarshalError),
}
