//! Path utilities for tree walks.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::error::AllocError;

/// Longest path, in bytes, that a tree walk will construct.
pub const MAX_PATH_LEN: usize = 4096;

/// Deepest directory nesting a tree walk will descend into.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Join `name` onto `dir`, refusing results longer than [`MAX_PATH_LEN`].
///
/// `name` must be a single component. Names containing a separator fail with `EINVAL`.
pub fn join_bounded(dir: &Path, name: &OsStr) -> Result<PathBuf, AllocError> {
    if name.as_encoded_bytes().contains(&b'/') {
        return Err(AllocError::Provider(std::io::Error::from_raw_os_error(
            libc::EINVAL,
        )));
    }

    let joined_len = dir.as_os_str().len() + 1 + name.len();
    if joined_len > MAX_PATH_LEN {
        return Err(AllocError::PathTooLong(dir.join(name)));
    }
    Ok(dir.join(name))
}

/// The directory an entry lives in, used as the starting point of root resolution.
///
/// Mirrors `dirname(3)`: a bare name resolves to the current directory (`""`), and the root is its
/// own parent.
#[must_use]
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) => parent,
        None => path,
    }
}
