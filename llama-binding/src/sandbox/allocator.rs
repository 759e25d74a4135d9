//! Tracking allocator over sandbox linear memory.
//!
//! Every block allocated while marshaling one request is recorded so the
//! whole set can be freed in one go, possibly long after the export
//! returned (generation frees only once its done id has fired).

use super::SandboxModule;
use crate::error::{MarshalError, SandboxError};
use crate::layout::{Abi, PointerAllocator};
use tracing::warn;

/// Blocks owned by one logical sandbox call.
#[derive(Debug, Default)]
#[must_use = "an allocation scope leaks sandbox memory unless released"]
pub struct AllocationScope {
    blocks: Vec<u32>,
}

impl AllocationScope {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Free every block, newest first.
    pub fn release(mut self, module: &mut dyn SandboxModule) {
        while let Some(ptr) = self.blocks.pop() {
            if let Err(e) = module.free(ptr) {
                warn!("Failed to free sandbox block {:#x}: {}", ptr, e);
            }
        }
    }
}

pub struct TrackingAllocator<'m> {
    module: &'m mut dyn SandboxModule,
    scope: AllocationScope,
}

impl<'m> TrackingAllocator<'m> {
    pub fn new(module: &'m mut dyn SandboxModule) -> Self {
        Self {
            module,
            scope: AllocationScope::default(),
        }
    }

    /// NUL-terminated string, as an export argument.
    pub fn cstr(&mut self, value: &str) -> Result<i32, MarshalError> {
        self.alloc_cstr(value).map(as_arg)
    }

    /// Zeroed output buffer of `len` bytes, as an export argument.
    pub fn buffer(&mut self, len: usize) -> Result<i32, MarshalError> {
        self.alloc(&vec![0u8; len], 8).map(as_arg)
    }

    /// Hand the recorded blocks over for release after the call.
    pub fn finish(self) -> AllocationScope {
        self.scope
    }

    /// Free everything allocated so far (marshaling failed midway).
    pub fn abandon(self) {
        let Self { module, scope } = self;
        scope.release(module);
    }
}

/// Sandbox pointers are 32-bit; exports take them as i32.
pub fn as_arg(address: u64) -> i32 {
    address as u32 as i32
}

impl PointerAllocator for TrackingAllocator<'_> {
    fn abi(&self) -> Abi {
        Abi::Wasm32
    }

    fn alloc(&mut self, bytes: &[u8], align: usize) -> Result<u64, MarshalError> {
        if align > 8 {
            return Err(MarshalError::Allocation(format!(
                "alignment {} is not supported by the sandbox allocator",
                align
            )));
        }
        let size = u32::try_from(bytes.len().max(1))
            .map_err(|_| MarshalError::ArrayTooLong { len: bytes.len() })?;
        let ptr = self.module.malloc(size).map_err(allocation_error)?;
        if ptr == 0 {
            return Err(MarshalError::Allocation(format!(
                "sandbox malloc({}) returned null",
                size
            )));
        }
        self.scope.blocks.push(ptr);
        if ptr % (align.max(1) as u32) != 0 {
            return Err(MarshalError::Allocation(format!(
                "sandbox malloc returned {:#x}, not {}-byte aligned",
                ptr, align
            )));
        }
        self.module.write(ptr, bytes).map_err(allocation_error)?;
        Ok(u64::from(ptr))
    }
}

fn allocation_error(e: SandboxError) -> MarshalError {
    MarshalError::Allocation(e.to_string())
}
