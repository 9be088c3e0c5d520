//! Rebuilding in-use counters from what is actually on disk.
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use tracing::debug;

use super::state::StateCache;
use crate::error::AllocError;
use crate::io::join_bounded;
use crate::provider::{EntryKind, StorageProvider, is_private_name};
use crate::space::space_consumed_signed;

struct Pending {
    dir: PathBuf,
    depth: usize,
    /// Root governing the directory holding `dir`. `None` for the top of the scan.
    parent_root: Option<PathBuf>,
}

/// Charge every file under `top` to its governing root, and every nested root to the root above it
/// by its full capacity.
///
/// The cache must be in recovery mode so that each record starts from zero when first loaded. The
/// result depends only on the tree's contents, never on previously persisted usage.
pub(crate) async fn scan<P: StorageProvider>(
    cache: &mut StateCache<P>,
    provider: &P,
    top: &Path,
    max_depth: usize,
) -> Result<(), AllocError> {
    let mut stack = vec![Pending {
        dir: top.to_path_buf(),
        depth: 0,
        parent_root: None,
    }];

    while let Some(Pending {
        dir,
        depth,
        parent_root,
    }) = stack.pop()
    {
        let root = cache.load_exact(&dir).await?;

        if let Some(parent_root) = parent_root.filter(|parent_root| *parent_root != root) {
            let capacity = cache.ensure(&root).await?.total_size();
            cache.charge(&parent_root, capacity).await?;
        }

        for entry in provider.read_dir(&dir).await? {
            if is_private_name(&entry.name) {
                continue;
            }
            let path = join_bounded(&dir, &entry.name)?;

            match entry.kind {
                EntryKind::File => {
                    cache.charge(&root, space_consumed_signed(entry.size)).await?;
                }
                EntryKind::Directory => {
                    if depth >= max_depth {
                        return Err(AllocError::TooDeep(path));
                    }
                    stack.push(Pending {
                        dir: path,
                        depth: depth + 1,
                        parent_root: Some(root.clone()),
                    });
                }
                EntryKind::Other => {
                    debug!(path = %path.display(), "Skipping entry of unknown type.");
                }
            }
        }

        if let Some(record) = cache.cached(&root) {
            debug!(
                dir = %dir.display(),
                root = %root.display(),
                in_use = %ByteSize::b(u64::try_from(record.in_use()).unwrap_or_default()),
                "Scanned directory."
            );
        }
    }

    Ok(())
}
