//! A provider that directly overlays a directory of the host filesystem.
use std::fs::File;
use std::io::{Read as _, Seek as _, SeekFrom};
use std::os::unix::fs::FileExt as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use nix::sys::statvfs::{Statvfs, fstatvfs, statvfs};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    DirEntry, EntryStat, FileHandle, FsStats, LockableFile, OpenFlags, StorageProvider,
    is_private_name,
};

fn errno(code: i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(code)
}

/// Run a blocking filesystem call off the async executor.
async fn blocking<T, F>(f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

#[allow(
    clippy::useless_conversion,
    reason = "statvfs field widths differ across platforms"
)]
fn stats_from(stat: &Statvfs) -> FsStats {
    FsStats {
        // Block counts from statvfs are in fragment-size units.
        block_size: u64::from(stat.fragment_size()),
        total_blocks: u64::from(stat.blocks()),
        free_blocks: u64::from(stat.blocks_free()),
        available_blocks: u64::from(stat.blocks_available()),
        total_inodes: u64::from(stat.files()),
        free_inodes: u64::from(stat.files_free()),
        max_filename_length: u64::from(stat.name_max()),
    }
}

struct Inner {
    base: PathBuf,
    open_files: scc::HashMap<FileHandle, Arc<File>>,
    next_fh: AtomicU64,
}

/// Exports the tree rooted at a host directory.
///
/// Virtual paths are interpreted relative to the base directory; `..` components are refused so
/// no request can escape it. Cloning is cheap and clones share the open-file table.
#[derive(Clone)]
pub struct LocalProvider {
    inner: Arc<Inner>,
}

impl LocalProvider {
    /// Create a provider exporting `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                base: base.into(),
                open_files: scc::HashMap::new(),
                next_fh: AtomicU64::new(1),
            }),
        }
    }

    /// The host directory this provider exports.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    /// Map a virtual path onto the host filesystem.
    pub fn host_path(&self, path: &Path) -> std::io::Result<PathBuf> {
        let mut host = self.inner.base.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => host.push(name),
                Component::ParentDir | Component::Prefix(_) => {
                    warn!(path = %path.display(), "Refusing path that escapes the exported tree.");
                    return Err(errno(libc::EACCES));
                }
            }
        }
        Ok(host)
    }

    fn file(&self, fh: FileHandle) -> std::io::Result<Arc<File>> {
        self.inner
            .open_files
            .read_sync(&fh, |_, file| Arc::clone(file))
            .ok_or_else(|| {
                debug!(fh, "Unknown file handle.");
                errno(libc::EBADF)
            })
    }
}

impl StorageProvider for LocalProvider {
    type Lockable = LocalLockFile;

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> std::io::Result<FileHandle> {
        let host = self.host_path(path)?;
        let exclusive = flags.contains(OpenFlags::CREAT | OpenFlags::EXCL);
        let file = tokio::fs::OpenOptions::new()
            .read(!flags.contains(OpenFlags::WRONLY))
            .write(flags.is_writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .create(flags.contains(OpenFlags::CREAT) && !exclusive)
            .create_new(exclusive)
            .mode(mode)
            .open(&host)
            .await?
            .into_std()
            .await;

        let fh = self.inner.next_fh.fetch_add(1, Ordering::Relaxed);
        drop(self.inner.open_files.insert_sync(fh, Arc::new(file)));
        Ok(fh)
    }

    async fn close(&self, fh: FileHandle) -> std::io::Result<()> {
        self.inner
            .open_files
            .remove_sync(&fh)
            .map(drop)
            .ok_or_else(|| errno(libc::EBADF))
    }

    async fn pread(&self, fh: FileHandle, size: usize, offset: u64) -> std::io::Result<Bytes> {
        let file = self.file(fh)?;
        blocking(move || {
            let mut buf = vec![0u8; size];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn pwrite(&self, fh: FileHandle, data: &[u8], offset: u64) -> std::io::Result<u64> {
        let file = self.file(fh)?;
        let data = data.to_vec();
        blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(data.len() as u64)
        })
        .await
    }

    async fn swrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        stride_length: u64,
        stride_skip: u64,
        offset: u64,
    ) -> std::io::Result<u64> {
        let stride = usize::try_from(stride_length)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| errno(libc::EINVAL))?;
        let file = self.file(fh)?;
        let data = data.to_vec();
        blocking(move || {
            let mut total = 0u64;
            let mut offset = offset;
            for piece in data.chunks_exact(stride) {
                file.write_all_at(piece, offset)?;
                total += stride_length;
                offset = offset.saturating_add(stride_skip);
            }
            Ok(total)
        })
        .await
    }

    async fn fsize(&self, fh: FileHandle) -> std::io::Result<u64> {
        let file = self.file(fh)?;
        blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn ftruncate(&self, fh: FileHandle, len: u64) -> std::io::Result<()> {
        let file = self.file(fh)?;
        blocking(move || file.set_len(len)).await
    }

    async fn truncate(&self, path: &Path, len: u64) -> std::io::Result<()> {
        let host = self.host_path(path)?;
        let file = tokio::fs::OpenOptions::new().write(true).open(&host).await?;
        file.set_len(len).await
    }

    async fn stat(&self, path: &Path) -> std::io::Result<EntryStat> {
        let meta = tokio::fs::metadata(self.host_path(path)?).await?;
        Ok(EntryStat {
            kind: meta.file_type().into(),
            size: meta.len(),
        })
    }

    async fn unlink(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(self.host_path(path)?).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(self.host_path(from)?, self.host_path(to)?).await
    }

    async fn link(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::hard_link(self.host_path(from)?, self.host_path(to)?).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        tokio::fs::DirBuilder::new()
            .mode(mode)
            .create(self.host_path(path)?)
            .await
    }

    async fn rmdir(&self, path: &Path) -> std::io::Result<()> {
        let host = self.host_path(path)?;

        let mut entries = tokio::fs::read_dir(&host).await?;
        let mut private = Vec::new();
        let mut only_private = true;
        while let Some(entry) = entries.next_entry().await? {
            if is_private_name(&entry.file_name()) {
                private.push(entry.path());
            } else {
                only_private = false;
            }
        }

        // Bookkeeping files go with their directory, but only once nothing else is left.
        if only_private {
            for path in private {
                tokio::fs::remove_file(&path).await?;
            }
        }

        tokio::fs::remove_dir(&host).await
    }

    async fn statfs(&self, path: &Path) -> std::io::Result<FsStats> {
        let host = self.host_path(path)?;
        blocking(move || Ok(stats_from(&statvfs(host.as_path())?))).await
    }

    async fn fstatfs(&self, fh: FileHandle) -> std::io::Result<FsStats> {
        let file = self.file(fh)?;
        blocking(move || Ok(stats_from(&fstatvfs(&*file)?))).await
    }

    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<DirEntry>> {
        let mut read_dir = tokio::fs::read_dir(self.host_path(path)?).await?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = ?entry.path(), "Entry vanished while listing.");
                    continue;
                }
                Err(e) => return Err(e),
            };
            entries.push(DirEntry {
                name: entry.file_name(),
                kind: meta.file_type().into(),
                size: meta.len(),
            });
        }
        Ok(entries)
    }

    async fn put_file<S>(
        &self,
        path: &Path,
        stream: &mut S,
        length: u64,
        mode: u32,
        deadline: Instant,
    ) -> std::io::Result<u64>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.host_path(path)?)
            .await?;

        let mut limited = (&mut *stream).take(length);
        let received =
            tokio::time::timeout_at(deadline, tokio::io::copy(&mut limited, &mut file))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        file.flush().await?;

        if received == length {
            Ok(received)
        } else {
            debug!(received, length, "Stream ended before the whole file arrived.");
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("received {received} of {length} bytes"),
            ))
        }
    }

    async fn store(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(self.host_path(path)?, contents).await
    }

    async fn open_lockable(&self, path: &Path) -> std::io::Result<LocalLockFile> {
        let host = self.host_path(path)?;
        let file = blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(host)
        })
        .await?;
        Ok(LocalLockFile {
            file: Arc::new(file),
            locked: false,
        })
    }
}

/// A host file locked with `flock(2)`.
///
/// The lock belongs to the open file description, so two handles on the same file exclude each
/// other even inside one process.
pub struct LocalLockFile {
    file: Arc<File>,
    locked: bool,
}

impl LocalLockFile {
    fn try_flock(&self) -> std::io::Result<bool> {
        match fs2::FileExt::try_lock_exclusive(&*self.file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl LockableFile for LocalLockFile {
    fn test_lock(&self) -> std::io::Result<bool> {
        if self.locked {
            return Ok(true);
        }
        let free = self.try_flock()?;
        if free {
            fs2::FileExt::unlock(&*self.file)?;
        }
        Ok(free)
    }

    fn try_lock(&mut self) -> std::io::Result<bool> {
        if !self.locked {
            self.locked = self.try_flock()?;
        }
        Ok(self.locked)
    }

    async fn lock(&mut self) -> std::io::Result<()> {
        if self.locked {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        blocking(move || fs2::FileExt::lock_exclusive(&*file)).await?;
        self.locked = true;
        Ok(())
    }

    fn read_contents(&mut self) -> std::io::Result<String> {
        let mut contents = String::new();
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }

    fn rewrite(&mut self, contents: &[u8]) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.write_all_at(contents, 0)
    }
}

impl Drop for LocalLockFile {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = fs2::FileExt::unlock(&*self.file) {
                warn!(error = %e, "Failed to release allocation lock.");
            }
        }
    }
}
