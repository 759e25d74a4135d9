//! Bindings to the native inference backend.
//!
//! Two interchangeable variants implement [`InferenceBackend`]:
//!
//! - [`DirectBinding`] loads the backend as a shared library (plus its
//!   platform dependencies) and calls it through resolved function pointers.
//! - [`SandboxedBinding`] drives a sandbox-compiled backend on a worker
//!   thread through JSON messages, packing parameters into the sandbox's
//!   own linear memory.
//!
//! Both pack parameter blocks through the same layout tables ([`ffi`]), so
//! the byte layout seen by the backend is identical apart from pointer width.
//!
//! # Example
//!
//! ```no_run
//! use llama_binding::{Binding, DirectBinding, DirectConfig, InferenceBackend};
//!
//! let binding = Binding::Direct(DirectBinding::new(DirectConfig::new("./libs")));
//! binding.ensure_loaded()?;
//! binding.add_turn("input", "user", "Hello!", Box::new(|ok| println!("added: {}", ok)));
//! # Ok::<(), llama_binding::BindingError>(())
//! ```

pub mod backend;
pub mod direct;
pub mod error;
pub mod ffi;
pub mod layout;
pub mod marshal;
pub mod platform;
pub mod sandbox;

pub use backend::{Binding, BindingState, InferenceBackend};
pub use direct::{DirectBinding, DirectConfig};
pub use error::{BindingError, MarshalError, Result, SandboxError};
pub use ffi::BridgeFunctions;
pub use layout::{Abi, PackedStruct, StructDef, StructReader};
pub use platform::PlatformKey;
pub use sandbox::{EventSink, ModuleFactory, SandboxModule, SandboxedBinding};
