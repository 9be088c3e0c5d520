//! Handle to path bookkeeping for handle-based operations.
use std::path::{Path, PathBuf};

use crate::provider::{FileHandle, OpenFlags};

/// What the registry remembers about one open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// The path the handle was opened with.
    pub path: PathBuf,
    /// The flags the handle was opened with.
    pub flags: OpenFlags,
}

impl Descriptor {
    /// Whether every write through this handle lands at end of file, whatever offset it names.
    #[must_use]
    pub fn appends(&self) -> bool {
        self.flags.contains(OpenFlags::APPEND)
    }
}

/// Remembers the path and flags each open handle was opened with.
#[derive(Default)]
pub struct DescriptorRegistry {
    descriptors: scc::HashMap<FileHandle, Descriptor>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `fh` was opened at `path` with `flags`. A reused handle number replaces the
    /// stale entry.
    pub fn register(&self, fh: FileHandle, path: &Path, flags: OpenFlags) {
        self.descriptors.upsert_sync(
            fh,
            Descriptor {
                path: path.to_path_buf(),
                flags,
            },
        );
    }

    /// Everything known about `fh`.
    #[must_use]
    pub fn get(&self, fh: FileHandle) -> Option<Descriptor> {
        self.descriptors.read_sync(&fh, |_, descriptor| descriptor.clone())
    }

    /// The path `fh` was opened with.
    #[must_use]
    pub fn path(&self, fh: FileHandle) -> Option<PathBuf> {
        self.descriptors
            .read_sync(&fh, |_, descriptor| descriptor.path.clone())
    }

    /// Drop the entry for `fh`, returning its path.
    pub fn forget(&self, fh: FileHandle) -> Option<PathBuf> {
        self.descriptors
            .remove_sync(&fh)
            .map(|(_, descriptor)| descriptor.path)
    }

    /// Number of open handles being tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no handles are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
