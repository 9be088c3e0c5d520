//! quotad shared library: space allocations for storage servers.

/// Directory-tree allocations and the accounting around them.
pub mod alloc;
/// Errors reported by the allocation layer.
pub mod error;
pub mod io;
/// Storage backends.
pub mod provider;
pub mod space;

pub use alloc::{AllocOptions, AllocationInfo, RecoverySummary, SpaceManager};
pub use error::AllocError;
