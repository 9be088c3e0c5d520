//! Quota-aware wrappers around provider operations.
use std::path::Path;
use std::time::Instant;

use bytesize::ByteSize;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use super::record::{AllocationRecord, creation_marker, marker_path};
use super::registry::DescriptorRegistry;
use super::state::StateCache;
use super::{AllocationInfo, RecoverySummary, recover};
use crate::error::AllocError;
use crate::provider::{FileHandle, FsStats, LockableFile as _, OpenFlags, StorageProvider};
use crate::space::{charge_delta, space_consumed_signed};

fn signed(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn out_of_space(root: &Path, available: i64, needed: i64) -> AllocError {
    debug!(root = %root.display(), available, needed, "Refusing charge.");
    AllocError::OutOfSpace {
        root: root.to_path_buf(),
        needed,
        available,
    }
}

/// Admit a charge of `needed` bytes if it fits in what is left.
fn require(root: &Path, available: i64, needed: i64) -> Result<(), AllocError> {
    if available >= needed {
        Ok(())
    } else {
        Err(out_of_space(root, available, needed))
    }
}

/// Admit only if strictly more than `amount` bytes remain.
fn require_more_than(root: &Path, available: i64, amount: i64) -> Result<(), AllocError> {
    if available > amount {
        Ok(())
    } else {
        Err(out_of_space(root, available, amount))
    }
}

/// Report the allocation's capacity and headroom instead of the backing filesystem's.
fn apply_quota(mut stats: FsStats, record: &AllocationRecord) -> FsStats {
    if stats.block_size == 0 {
        return stats;
    }
    let total = u64::try_from(record.total_size()).unwrap_or_default();
    let available = u64::try_from(record.available()).unwrap_or_default();

    stats.total_blocks = total / stats.block_size;
    stats.free_blocks = available / stats.block_size;
    stats.available_blocks = available / stats.block_size;
    stats
}

/// Enforces allocations over a provider.
///
/// Every charge goes through the [`StateCache`]; operations hold its lock for their whole duration,
/// so within one process operations run one at a time. Other processes are excluded by the marker
/// locks the cache holds.
///
/// Once a marker lock cannot be acquired, every later accounted operation fails with the same
/// [`AllocError::LockFailed`].
pub struct QuotaEnforcer<P: StorageProvider> {
    provider: P,
    state: Mutex<StateCache<P>>,
    descriptors: DescriptorRegistry,
    max_depth: usize,
}

impl<P: StorageProvider> QuotaEnforcer<P> {
    /// Enforce allocations found on `provider` without scanning it first.
    pub fn new(provider: P, max_depth: usize) -> Self {
        Self {
            state: Mutex::new(StateCache::new(provider.clone())),
            provider,
            descriptors: DescriptorRegistry::new(),
            max_depth,
        }
    }

    /// The provider this enforcer wraps.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The registry of open handles.
    pub fn descriptors(&self) -> &DescriptorRegistry {
        &self.descriptors
    }

    /// The state cache, unless an earlier lock failure made it unusable.
    async fn lock_state(&self) -> Result<MutexGuard<'_, StateCache<P>>, AllocError> {
        let state = self.state.lock().await;
        state.check_usable()?;
        Ok(state)
    }

    /// Make `root` a quota root of `total_size` bytes and rebuild every counter beneath it.
    #[instrument(name = "QuotaEnforcer::recover", skip(self))]
    pub async fn recover(
        &self,
        root: &Path,
        total_size: u64,
    ) -> Result<RecoverySummary, AllocError> {
        debug!("Beginning allocation recovery scan.");
        let marker = marker_path(root);
        self.provider
            .store(&marker, creation_marker(total_size).as_bytes())
            .await?;

        // Probe for lock support on the marker we just wrote.
        let probe = self.provider.open_lockable(&marker).await?;
        if let Err(e) = probe.test_lock() {
            if matches!(e.raw_os_error(), Some(libc::ENOSYS | libc::EOPNOTSUPP)) {
                warn!(error = %e, "Storage cannot lock files; allocations unavailable.");
                return Err(AllocError::Unsupported);
            }
            return Err(AllocError::LockFailed {
                root: root.to_path_buf(),
                source: e,
            });
        }
        drop(probe);

        let started = Instant::now();
        let mut state = self.lock_state().await?;
        state.set_recovering(true);
        let scanned = self.scan(&mut state, root).await;
        state.set_recovering(false);
        let record = scanned?;

        let summary = RecoverySummary {
            root: root.to_path_buf(),
            total_size: record.total_size(),
            in_use: record.in_use(),
            available: record.available(),
            elapsed: started.elapsed(),
        };
        info!(
            root = %root.display(),
            elapsed = ?summary.elapsed,
            total = %ByteSize::b(total_size),
            in_use = %ByteSize::b(u64::try_from(summary.in_use).unwrap_or_default()),
            available = %ByteSize::b(u64::try_from(summary.available).unwrap_or_default()),
            "Allocation recovery finished."
        );
        Ok(summary)
    }

    async fn scan(
        &self,
        state: &mut StateCache<P>,
        root: &Path,
    ) -> Result<AllocationRecord, AllocError> {
        state.load_exact(root).await?;
        recover::scan(state, &self.provider, root, self.max_depth).await?;
        let record = state.ensure(root).await?.clone();
        state.flush_all()?;
        Ok(record)
    }

    /// Open a file, debiting its old contents when the open truncates.
    #[instrument(name = "QuotaEnforcer::open", skip(self))]
    pub async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<FileHandle, AllocError> {
        let mut state = self.lock_state().await?;
        let root = state.load_for(path).await?;

        let existing = self.provider.stat(path).await.map_or(0, |stat| stat.size);

        let fh = self.provider.open(path, flags, mode).await?;
        self.descriptors.register(fh, path, flags);
        if flags.contains(OpenFlags::TRUNC) {
            state.charge(&root, -space_consumed_signed(existing)).await?;
        }
        Ok(fh)
    }

    /// Forget a handle and close it. Never fails.
    #[instrument(name = "QuotaEnforcer::close", skip(self))]
    pub async fn close(&self, fh: FileHandle) {
        self.descriptors.forget(fh);
        if let Err(e) = self.provider.close(fh).await {
            debug!(fh, error = %e, "Provider failed to close handle.");
        }
    }

    /// Positional write, admitted only if the growth fits.
    ///
    /// On a handle opened with [`OpenFlags::APPEND`] the data lands at end of file whatever
    /// `offset` says, so growth is measured from there.
    #[instrument(name = "QuotaEnforcer::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, fh: FileHandle, data: &[u8], offset: u64) -> Result<u64, AllocError> {
        let descriptor = self.descriptors.get(fh).ok_or(AllocError::BadHandle(fh))?;
        let mut state = self.lock_state().await?;
        let root = state.load_for(&descriptor.path).await?;

        let old_len = self.provider.fsize(fh).await?;
        let start = if descriptor.appends() { old_len } else { offset };
        let end = start.saturating_add(data.len() as u64);
        let needed = charge_delta(old_len, end.max(old_len));
        require(&root, state.available(&root).await?, needed)?;

        let written = self.provider.pwrite(fh, data, offset).await?;
        if written > 0 {
            let end = start.saturating_add(written);
            state.charge(&root, charge_delta(old_len, end.max(old_len))).await?;
        }
        Ok(written)
    }

    /// Strided write. Not accounted: the extent of a strided write is never charged.
    #[instrument(name = "QuotaEnforcer::swrite", skip(self, data), fields(len = data.len()))]
    pub async fn swrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        stride_length: u64,
        stride_skip: u64,
        offset: u64,
    ) -> Result<u64, AllocError> {
        debug!("Strided write is not accounted.");
        Ok(self
            .provider
            .swrite(fh, data, stride_length, stride_skip, offset)
            .await?)
    }

    /// Truncate an open file, admitted only if the growth fits.
    #[instrument(name = "QuotaEnforcer::ftruncate", skip(self))]
    pub async fn ftruncate(&self, fh: FileHandle, len: u64) -> Result<(), AllocError> {
        let path = self.descriptors.path(fh).ok_or(AllocError::BadHandle(fh))?;
        let mut state = self.lock_state().await?;
        let root = state.load_for(&path).await?;

        let old_len = self.provider.fsize(fh).await?;
        let delta = charge_delta(old_len, len);
        require(&root, state.available(&root).await?, delta)?;

        self.provider.ftruncate(fh, len).await?;
        state.charge(&root, delta).await
    }

    /// Truncate a file by path, admitted only if the growth fits.
    #[instrument(name = "QuotaEnforcer::truncate", skip(self))]
    pub async fn truncate(&self, path: &Path, len: u64) -> Result<(), AllocError> {
        let mut state = self.lock_state().await?;
        let root = state.load_for(path).await?;

        let old_len = self.provider.stat(path).await?.size;
        let delta = charge_delta(old_len, len);
        require(&root, state.available(&root).await?, delta)?;

        self.provider.truncate(path, len).await?;
        state.charge(&root, delta).await
    }

    /// Filesystem statistics for an open file, reporting the allocation's capacity.
    #[instrument(name = "QuotaEnforcer::fstatfs", skip(self))]
    pub async fn fstatfs(&self, fh: FileHandle) -> Result<FsStats, AllocError> {
        let path = self.descriptors.path(fh).ok_or(AllocError::BadHandle(fh))?;
        let mut state = self.lock_state().await?;
        let root = state.load_for(&path).await?;

        let stats = self.provider.fstatfs(fh).await?;
        Ok(apply_quota(stats, state.ensure(&root).await?))
    }

    /// Filesystem statistics for a path, reporting the allocation's capacity.
    #[instrument(name = "QuotaEnforcer::statfs", skip(self))]
    pub async fn statfs(&self, path: &Path) -> Result<FsStats, AllocError> {
        let mut state = self.lock_state().await?;
        let root = state.load_for(path).await?;

        let stats = self.provider.statfs(path).await?;
        Ok(apply_quota(stats, state.ensure(&root).await?))
    }

    /// Remove a file and credit its space back.
    #[instrument(name = "QuotaEnforcer::unlink", skip(self))]
    pub async fn unlink(&self, path: &Path) -> Result<(), AllocError> {
        let mut state = self.lock_state().await?;
        let root = state.load_for(path).await?;

        let size = self.provider.stat(path).await?.size;
        self.provider.unlink(path).await?;
        state.charge(&root, -space_consumed_signed(size)).await
    }

    /// Rename within or across allocations. Crossing allocations moves the charge and flushes.
    ///
    /// A file the rename replaces at `to` is not credited back; its charge stays until the next
    /// recovery scan.
    #[instrument(name = "QuotaEnforcer::rename", skip(self))]
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), AllocError> {
        let mut state = self.lock_state().await?;
        let source = state.load_for(from).await?;
        let dest = state.load_for(to).await?;

        if source == dest {
            return Ok(self.provider.rename(from, to).await?);
        }

        let moved = space_consumed_signed(self.provider.stat(from).await?.size);
        require(&dest, state.available(&dest).await?, moved)?;

        let renamed = self.provider.rename(from, to).await;
        if renamed.is_ok() {
            state.charge(&source, -moved).await?;
            state.charge(&dest, moved).await?;
        }
        state.flush_all()?;
        Ok(renamed?)
    }

    /// Hard links would leave a file's space ambiguous between allocations.
    pub fn link(&self, from: &Path, to: &Path) -> Result<(), AllocError> {
        debug!(from = %from.display(), to = %to.display(), "Refusing hard link under allocation.");
        Err(AllocError::PermissionDenied)
    }

    /// Remove a directory. Removing a quota root credits its full capacity to the root above it.
    #[instrument(name = "QuotaEnforcer::rmdir", skip(self))]
    pub async fn rmdir(&self, path: &Path) -> Result<(), AllocError> {
        let mut state = self.lock_state().await?;
        let removed = state.load_exact(path).await?;
        let capacity = state.ensure(&removed).await?.total_size();
        let parent = state.load_for(path).await?;

        self.provider.rmdir(path).await?;
        if removed != parent {
            state.charge(&parent, -capacity).await?;
            debug!(path = %path.display(), capacity, "rmalloc");
        }
        state.flush_all()
    }

    /// Carve a new allocation of `size` bytes out of the one governing `path`.
    #[instrument(name = "QuotaEnforcer::mkalloc", skip(self))]
    pub async fn mkalloc(&self, path: &Path, size: u64, mode: u32) -> Result<(), AllocError> {
        let mut state = self.lock_state().await?;
        let parent = state.load_for(path).await?;
        let size_signed = signed(size);
        require_more_than(&parent, state.available(&parent).await?, size_signed)?;

        self.provider.mkdir(path, mode).await?;
        self.provider
            .store(&marker_path(path), creation_marker(size).as_bytes())
            .await?;
        state.charge(&parent, size_signed).await?;
        debug!(path = %path.display(), size, "mkalloc");
        state.flush_all()
    }

    /// Report the allocation governing the directory `path`.
    #[instrument(name = "QuotaEnforcer::query_info", skip(self))]
    pub async fn query_info(&self, path: &Path) -> Result<AllocationInfo, AllocError> {
        let mut state = self.lock_state().await?;
        let root = state.load_exact(path).await?;
        let record = state.ensure(&root).await?;
        Ok(AllocationInfo {
            root: root.clone(),
            total_size: record.total_size(),
            in_use: record.in_use(),
        })
    }

    /// Receive exactly `length` bytes into `path`, replacing whatever was there.
    ///
    /// Either the whole file arrives and is charged, or nothing is left behind.
    #[instrument(name = "QuotaEnforcer::put_file", skip(self, stream))]
    pub async fn put_file<S>(
        &self,
        path: &Path,
        stream: &mut S,
        length: u64,
        mode: u32,
        deadline: tokio::time::Instant,
    ) -> Result<u64, AllocError>
    where
        S: AsyncRead + Unpin + Send,
    {
        match self.unlink(path).await {
            Ok(()) => {}
            Err(e) if e.is_os_error(libc::ENOENT) => {}
            Err(e) => return Err(e),
        }

        let mut state = self.lock_state().await?;
        let root = state.load_for(path).await?;
        require_more_than(&root, state.available(&root).await?, signed(length))?;

        match self
            .provider
            .put_file(path, stream, length, mode, deadline)
            .await
        {
            Ok(received) => {
                state.charge(&root, space_consumed_signed(received)).await?;
                Ok(received)
            }
            Err(e) => {
                debug!(error = %e, "Transfer failed; discarding partial file.");
                if let Err(cleanup) = self.provider.unlink(path).await {
                    debug!(error = %cleanup, "Could not remove partial file.");
                }
                Err(e.into())
            }
        }
    }

    /// Persist and release everything held.
    ///
    /// Still releases every lock after an earlier lock failure, then reports that failure.
    pub async fn flush(&self) -> Result<(), AllocError> {
        let mut state = self.state.lock().await;
        let flushed = state.flush_all();
        state.check_usable()?;
        flushed
    }

    /// Whether a flush has work to do.
    pub async fn flush_needed(&self) -> bool {
        self.state.lock().await.flush_needed()
    }

    /// When the last flush ran.
    pub async fn last_flush_time(&self) -> Option<std::time::SystemTime> {
        self.state.lock().await.last_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_replaces_backing_capacity() {
        let stats = FsStats {
            block_size: 4096,
            total_blocks: 1_000_000,
            free_blocks: 500_000,
            available_blocks: 400_000,
            total_inodes: 10,
            free_inodes: 5,
            max_filename_length: 255,
        };
        let mut record = AllocationRecord::new("/", 16384, 0);
        record.update(4096);

        let adjusted = apply_quota(stats, &record);
        assert_eq!(adjusted.total_blocks, 4);
        assert_eq!(adjusted.free_blocks, 3);
        assert_eq!(adjusted.available_blocks, 3);
        assert_eq!(adjusted.total_inodes, 10, "inode counts come from the provider");
    }

    #[test]
    fn overcommitted_root_reports_zero_free() {
        let stats = FsStats {
            block_size: 4096,
            total_blocks: 100,
            free_blocks: 100,
            available_blocks: 100,
            total_inodes: 0,
            free_inodes: 0,
            max_filename_length: 255,
        };
        let record = AllocationRecord::new("/", 4096, 8192);

        let adjusted = apply_quota(stats, &record);
        assert_eq!(adjusted.free_blocks, 0);
        assert_eq!(adjusted.available_blocks, 0);
    }

    #[test]
    fn strict_and_inclusive_admission() {
        let root = Path::new("/");
        assert!(require(root, 4096, 4096).is_ok());
        assert!(require(root, 4095, 4096).is_err());
        assert!(require(root, -4096, -8192).is_ok(), "shrinking always fits");
        assert!(require_more_than(root, 4096, 4096).is_err());
        assert!(require_more_than(root, 4097, 4096).is_ok());
    }
}
