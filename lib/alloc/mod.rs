//! Space allocations: directory trees whose disk usage is capped and tracked across processes.
//!
//! A directory becomes a quota root by carrying a [`MARKER_NAME`] file holding its capacity and
//! current usage. Every file is charged to the nearest root above it; a root nested inside another
//! is charged to its parent by its full capacity, whatever it actually holds.
//!
//! [`SpaceManager`] is the entry point. It either passes every operation straight to the provider,
//! when allocations are disabled, or routes them through a [`QuotaEnforcer`].

/// Quota-aware operation wrappers.
pub mod enforce;
mod recover;
/// Allocation records and the marker format.
pub mod record;
/// Handle to path bookkeeping.
pub mod registry;
/// Path to quota-root resolution.
pub mod resolve;
/// Cached records and the locking protocol.
pub mod state;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, instrument};

pub use enforce::QuotaEnforcer;
pub use record::{AllocationRecord, MARKER_NAME};

use crate::error::AllocError;
use crate::io::{DEFAULT_MAX_DEPTH, join_bounded};
use crate::provider::{FileHandle, FsStats, OpenFlags, StorageProvider, is_private_name};

/// Buffer size used when receiving a stream of unknown length.
pub const STREAM_BUFFER_SIZE: usize = 65536;

/// Sent to the peer before a stream of unknown length is received.
const STREAM_ACK: &[u8] = b"0\n";

/// What [`SpaceManager::query_info`] reports about an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    /// The quota root.
    pub root: PathBuf,
    /// Configured capacity in bytes.
    pub total_size: i64,
    /// Bytes currently charged.
    pub in_use: i64,
}

impl AllocationInfo {
    /// Remaining capacity, never negative.
    #[must_use]
    pub fn available(&self) -> i64 {
        self.total_size.saturating_sub(self.in_use).max(0)
    }
}

/// Totals produced by the startup recovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    /// The top-level quota root that was scanned.
    pub root: PathBuf,
    /// Configured capacity in bytes.
    pub total_size: i64,
    /// Bytes found in use.
    pub in_use: i64,
    /// `total_size - in_use`. Negative when the tree already holds more than fits.
    pub available: i64,
    /// How long the scan took.
    pub elapsed: Duration,
}

/// Tunables for the allocation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocOptions {
    /// Deepest directory nesting tree walks descend into.
    pub max_depth: usize,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

enum Strategy<P: StorageProvider> {
    PassThrough(P),
    Enforced(QuotaEnforcer<P>),
}

/// The allocation layer for one server process.
///
/// Whether allocations are enforced is decided once, at construction.
pub struct SpaceManager<P: StorageProvider> {
    strategy: Strategy<P>,
    options: AllocOptions,
}

impl<P: StorageProvider> SpaceManager<P> {
    /// Allocations disabled: every operation goes straight to `provider`.
    pub fn pass_through(provider: P) -> Self {
        Self {
            strategy: Strategy::PassThrough(provider),
            options: AllocOptions::default(),
        }
    }

    /// Enforce allocations already present on `provider`, without a recovery scan.
    ///
    /// For processes joining a tree some other process initialized.
    pub fn attach(provider: P, options: AllocOptions) -> Self {
        Self {
            strategy: Strategy::Enforced(QuotaEnforcer::new(provider, options.max_depth)),
            options,
        }
    }

    /// Make `root` an allocation of `size` bytes and recover usage from the tree beneath it.
    ///
    /// A `size` of zero disables allocations and skips the scan.
    pub async fn initialize(
        provider: P,
        root: &Path,
        size: u64,
    ) -> Result<(Self, Option<RecoverySummary>), AllocError> {
        Self::initialize_with(provider, root, size, AllocOptions::default()).await
    }

    /// [`initialize`](Self::initialize) with explicit options.
    pub async fn initialize_with(
        provider: P,
        root: &Path,
        size: u64,
        options: AllocOptions,
    ) -> Result<(Self, Option<RecoverySummary>), AllocError> {
        if size == 0 {
            debug!("Allocations disabled.");
            let mut manager = Self::pass_through(provider);
            manager.options = options;
            return Ok((manager, None));
        }

        let enforcer = QuotaEnforcer::new(provider, options.max_depth);
        let summary = enforcer.recover(root, size).await?;
        Ok((
            Self {
                strategy: Strategy::Enforced(enforcer),
                options,
            },
            Some(summary),
        ))
    }

    /// Whether allocations are enforced.
    #[must_use]
    pub fn is_enforced(&self) -> bool {
        matches!(self.strategy, Strategy::Enforced(_))
    }

    /// The underlying provider.
    pub fn provider(&self) -> &P {
        match &self.strategy {
            Strategy::PassThrough(provider) => provider,
            Strategy::Enforced(enforcer) => enforcer.provider(),
        }
    }

    /// Open a file.
    pub async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<FileHandle, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.open(path, flags, mode).await?),
            Strategy::Enforced(enforcer) => enforcer.open(path, flags, mode).await,
        }
    }

    /// Close a handle.
    pub async fn close(&self, fh: FileHandle) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.close(fh).await?),
            Strategy::Enforced(enforcer) => {
                enforcer.close(fh).await;
                Ok(())
            }
        }
    }

    /// Write `data` at `offset`.
    pub async fn write(&self, fh: FileHandle, data: &[u8], offset: u64) -> Result<u64, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.pwrite(fh, data, offset).await?),
            Strategy::Enforced(enforcer) => enforcer.write(fh, data, offset).await,
        }
    }

    /// Strided write. Never accounted.
    pub async fn swrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        stride_length: u64,
        stride_skip: u64,
        offset: u64,
    ) -> Result<u64, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider
                .swrite(fh, data, stride_length, stride_skip, offset)
                .await?),
            Strategy::Enforced(enforcer) => {
                enforcer
                    .swrite(fh, data, stride_length, stride_skip, offset)
                    .await
            }
        }
    }

    /// Filesystem statistics for an open file.
    pub async fn fstatfs(&self, fh: FileHandle) -> Result<FsStats, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.fstatfs(fh).await?),
            Strategy::Enforced(enforcer) => enforcer.fstatfs(fh).await,
        }
    }

    /// Set the length of an open file.
    pub async fn ftruncate(&self, fh: FileHandle, len: u64) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.ftruncate(fh, len).await?),
            Strategy::Enforced(enforcer) => enforcer.ftruncate(fh, len).await,
        }
    }

    /// Receive exactly `length` bytes into `path`. The file arrives whole or not at all.
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
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider
                .put_file(path, stream, length, mode, deadline)
                .await?),
            Strategy::Enforced(enforcer) => {
                enforcer.put_file(path, stream, length, mode, deadline).await
            }
        }
    }

    /// Receive a stream of unknown length into `path`, returning the bytes accepted.
    ///
    /// The peer is sent an acknowledgement first, then every chunk read before EOF or `deadline`
    /// goes through [`write`](Self::write). The transfer stops at the first chunk that cannot be
    /// written whole; whatever was written before it stays on disk and stays charged.
    #[instrument(name = "SpaceManager::put_stream", skip(self, stream))]
    pub async fn put_stream<S>(
        &self,
        path: &Path,
        stream: &mut S,
        deadline: tokio::time::Instant,
    ) -> Result<u64, AllocError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let fh = self
            .open(
                path,
                OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
                0o700,
            )
            .await?;

        let acked = tokio::time::timeout_at(deadline, async {
            stream.write_all(STREAM_ACK).await?;
            stream.flush().await
        })
        .await;
        if !matches!(acked, Ok(Ok(()))) {
            debug!("Failed to acknowledge stream.");
        }

        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        let mut total = 0u64;
        let mut fatal = None;
        loop {
            let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(error = %e, "Stream read failed.");
                    break;
                }
                Err(_) => {
                    debug!(total, "Stream timed out.");
                    break;
                }
            };

            match self.write(fh, &buf[..n], total).await {
                Ok(written) if written == n as u64 => total += written,
                Ok(written) => {
                    debug!(written, expected = n, "Short write; stopping stream.");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, total, "Write failed; stopping stream.");
                    if e.is_fatal() {
                        fatal = Some(e);
                    }
                    break;
                }
            }
        }

        self.close(fh).await?;
        fatal.map_or(Ok(total), Err)
    }

    /// Remove a file.
    pub async fn unlink(&self, path: &Path) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.unlink(path).await?),
            Strategy::Enforced(enforcer) => enforcer.unlink(path).await,
        }
    }

    /// Rename `from` to `to`.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.rename(from, to).await?),
            Strategy::Enforced(enforcer) => enforcer.rename(from, to).await,
        }
    }

    /// Create a hard link. Refused while allocations are enforced.
    pub async fn link(&self, from: &Path, to: &Path) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.link(from, to).await?),
            Strategy::Enforced(enforcer) => enforcer.link(from, to),
        }
    }

    /// Remove `path` and everything beneath it.
    ///
    /// Stops at the first entry that cannot be removed; entries removed before it stay removed.
    #[instrument(name = "SpaceManager::rmall", skip(self))]
    pub async fn rmall(&self, path: &Path) -> Result<(), AllocError> {
        enum Step {
            Remove { path: PathBuf, depth: usize },
            RemoveDir(PathBuf),
        }

        let mut steps = vec![Step::Remove {
            path: path.to_path_buf(),
            depth: 0,
        }];

        while let Some(step) = steps.pop() {
            match step {
                Step::RemoveDir(dir) => self.rmdir(&dir).await?,
                Step::Remove { path, depth } => match self.unlink(&path).await {
                    Ok(()) => {}
                    Err(e) if e.is_os_error(libc::EISDIR) => {
                        if depth >= self.options.max_depth {
                            return Err(AllocError::TooDeep(path));
                        }
                        let entries = self.provider().read_dir(&path).await?;
                        steps.push(Step::RemoveDir(path.clone()));
                        for entry in entries {
                            if is_private_name(&entry.name) {
                                continue;
                            }
                            steps.push(Step::Remove {
                                path: join_bounded(&path, &entry.name)?,
                                depth: depth + 1,
                            });
                        }
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Remove an empty directory. Removing a quota root returns its capacity to the root above.
    pub async fn rmdir(&self, path: &Path) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.rmdir(path).await?),
            Strategy::Enforced(enforcer) => enforcer.rmdir(path).await,
        }
    }

    /// Filesystem statistics for a path.
    pub async fn statfs(&self, path: &Path) -> Result<FsStats, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.statfs(path).await?),
            Strategy::Enforced(enforcer) => enforcer.statfs(path).await,
        }
    }

    /// Set the length of a file by path.
    pub async fn truncate(&self, path: &Path, len: u64) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(provider) => Ok(provider.truncate(path, len).await?),
            Strategy::Enforced(enforcer) => enforcer.truncate(path, len).await,
        }
    }

    /// Describe the allocation governing the directory `path`.
    pub async fn query_info(&self, path: &Path) -> Result<AllocationInfo, AllocError> {
        match &self.strategy {
            Strategy::PassThrough(_) => Err(AllocError::Disabled),
            Strategy::Enforced(enforcer) => enforcer.query_info(path).await,
        }
    }

    /// Create the directory `path` as a new allocation of `size` bytes.
    pub async fn mkalloc(&self, path: &Path, size: u64, mode: u32) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(_) => Err(AllocError::Disabled),
            Strategy::Enforced(enforcer) => enforcer.mkalloc(path, size, mode).await,
        }
    }

    /// Persist dirty records and release every lock this process holds.
    pub async fn flush(&self) -> Result<(), AllocError> {
        match &self.strategy {
            Strategy::PassThrough(_) => Ok(()),
            Strategy::Enforced(enforcer) => enforcer.flush().await,
        }
    }

    /// Whether this process holds allocation state a flush would publish.
    pub async fn flush_needed(&self) -> bool {
        match &self.strategy {
            Strategy::PassThrough(_) => false,
            Strategy::Enforced(enforcer) => enforcer.flush_needed().await,
        }
    }

    /// When state was last flushed, if ever.
    pub async fn last_flush_time(&self) -> Option<SystemTime> {
        match &self.strategy {
            Strategy::PassThrough(_) => None,
            Strategy::Enforced(enforcer) => enforcer.last_flush_time().await,
        }
    }

    /// Number of open handles being tracked for accounting. Always zero when not enforcing.
    #[must_use]
    pub fn tracked_handles(&self) -> usize {
        match &self.strategy {
            Strategy::PassThrough(_) => 0,
            Strategy::Enforced(enforcer) => enforcer.descriptors().len(),
        }
    }
}
