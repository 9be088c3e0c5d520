//! The accounting record for one quota root and its on-disk marker format.
use std::path::{Path, PathBuf};

use crate::error::AllocError;

/// Name of the marker file that turns a directory into a quota root.
pub const MARKER_NAME: &str = ".__alloc";

/// Where the marker for the root at `root` lives.
#[must_use]
pub fn marker_path(root: &Path) -> PathBuf {
    root.join(MARKER_NAME)
}

/// Marker contents for a freshly created root of `total_size` bytes.
#[must_use]
pub fn creation_marker(total_size: u64) -> String {
    format!("{total_size} 0\n")
}

/// In-memory accounting state of one quota root.
///
/// `in_use` never goes below zero. `available` is derived on demand and may be negative when a
/// root holds more than its capacity (for example, when recovery finds more data than fits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    root: PathBuf,
    total_size: i64,
    in_use: i64,
    dirty: bool,
}

impl AllocationRecord {
    /// A clean record.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, total_size: i64, in_use: i64) -> Self {
        Self {
            root: root.into(),
            total_size,
            in_use: in_use.max(0),
            dirty: false,
        }
    }

    /// Parse a persisted marker: two whitespace-separated integers, total then in-use.
    ///
    /// A negative total is corrupt; a negative in-use is clamped to zero.
    pub fn parse(root: &Path, contents: &str) -> Result<Self, AllocError> {
        let corrupt = || AllocError::CorruptMarker {
            root: root.to_path_buf(),
        };

        let mut fields = contents.split_ascii_whitespace().map(str::parse::<i64>);
        let total_size = fields
            .next()
            .and_then(Result::ok)
            .filter(|total| *total >= 0)
            .ok_or_else(corrupt)?;
        let in_use = fields.next().and_then(Result::ok).ok_or_else(corrupt)?;
        Ok(Self::new(root, total_size, in_use))
    }

    /// The persisted form written back at flush.
    #[must_use]
    pub fn to_marker(&self) -> String {
        format!("{}\n{}\n", self.total_size, self.in_use)
    }

    /// The quota root this record accounts for.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn total_size(&self) -> i64 {
        self.total_size
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn in_use(&self) -> i64 {
        self.in_use
    }

    /// `total_size - in_use`, possibly negative. Admission checks use this raw value.
    #[must_use]
    pub fn available(&self) -> i64 {
        self.total_size.saturating_sub(self.in_use)
    }

    /// Whether `in_use` changed since the record was loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Apply a charge (positive) or credit (negative).
    pub fn update(&mut self, delta: i64) {
        if delta != 0 {
            self.in_use = self.in_use.saturating_add(delta).max(0);
            self.dirty = true;
        }
    }

    /// Forget the persisted usage so a scan can rebuild it.
    pub(crate) fn reset_usage(&mut self) {
        self.in_use = 0;
        self.dirty = true;
    }
}
