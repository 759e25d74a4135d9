//! Runtime layer of the bridge: binding ownership, sessions and the model
//! lifecycle.
//!
//! - [`Runtime`] owns the loaded binding and the registry of model ids
//! - [`Session`] orders conversation operations over a pair of contexts
//! - [`ModelLifecycle`] takes one model from download to available, with
//!   retries at every stage
//!
//! All user-facing completions are delivered on the host's
//! [`task_scheduler::PrimaryContext`].

pub mod download;
pub mod error;
pub mod lifecycle;
pub mod runtime;
pub mod session;

pub use download::{DownloadProvider, HttpDownloadProvider, ProgressCallback};
pub use error::{DownloadError, LifecycleError};
pub use lifecycle::{LifecycleState, ModelLifecycle, ModelSource, StateObserver};
pub use runtime::{BindingLoader, PlatformLoader, Runtime, DEFAULT_MODEL_PREFIX};
pub use session::{Session, SessionOptions};
