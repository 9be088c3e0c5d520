//! Finding the quota root that governs a path.
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tracing::trace;

use super::record::marker_path;
use crate::provider::StorageProvider;

/// Caches which quota root governs a directory.
///
/// Entries stay valid only until the next flush; the directory structure may change under us
/// while no locks are held.
#[derive(Debug, Default)]
pub struct RootResolver {
    roots: FxHashMap<PathBuf, PathBuf>,
}

impl RootResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The nearest directory at or above `dir` carrying a marker, or `None` when no ancestor does.
    pub async fn resolve<P: StorageProvider>(
        &mut self,
        provider: &P,
        dir: &Path,
    ) -> std::io::Result<Option<PathBuf>> {
        if let Some(root) = self.roots.get(dir) {
            return Ok(Some(root.clone()));
        }

        for candidate in dir.ancestors() {
            if candidate.as_os_str().is_empty() {
                break;
            }
            match provider.stat(&marker_path(candidate)).await {
                Ok(_) => {
                    trace!(dir = %dir.display(), root = %candidate.display(), "Resolved quota root.");
                    self.roots.insert(dir.to_path_buf(), candidate.to_path_buf());
                    return Ok(Some(candidate.to_path_buf()));
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        || e.raw_os_error() == Some(libc::ENOTDIR) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Forget every cached resolution.
    pub fn clear(&mut self) {
        self.roots.clear();
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
