#![allow(missing_docs, clippy::unwrap_used)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quotad::provider::{
    DirEntry, EntryStat, FileHandle, FsStats, LockableFile, OpenFlags, StorageProvider,
};
use tokio::io::AsyncRead;
use tokio::time::Instant;

/// Wraps a provider and records the name of every call made through it.
///
/// Lock acquisition can be made to fail on demand with [`fail_locks`](Self::fail_locks).
#[derive(Clone)]
pub struct CountingProvider<P> {
    inner: P,
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_locks: Arc<AtomicBool>,
}

impl<P> CountingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_locks: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, acquiring any marker lock fails with `EIO`.
    pub fn fail_locks(&self, fail: bool) {
        self.fail_locks.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    /// How many times `call` was made.
    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

/// A lockable file whose acquisition fails while its provider says so.
pub struct SwitchableLock<L> {
    inner: L,
    fail: Arc<AtomicBool>,
}

impl<L> SwitchableLock<L> {
    fn check(&self) -> std::io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(std::io::Error::from_raw_os_error(libc::EIO))
        } else {
            Ok(())
        }
    }
}

impl<L: LockableFile> LockableFile for SwitchableLock<L> {
    fn test_lock(&self) -> std::io::Result<bool> {
        self.inner.test_lock()
    }

    fn try_lock(&mut self) -> std::io::Result<bool> {
        self.check()?;
        self.inner.try_lock()
    }

    async fn lock(&mut self) -> std::io::Result<()> {
        self.check()?;
        self.inner.lock().await
    }

    fn read_contents(&mut self) -> std::io::Result<String> {
        self.inner.read_contents()
    }

    fn rewrite(&mut self, contents: &[u8]) -> std::io::Result<()> {
        self.inner.rewrite(contents)
    }
}

impl<P: StorageProvider> StorageProvider for CountingProvider<P> {
    type Lockable = SwitchableLock<P::Lockable>;

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> std::io::Result<FileHandle> {
        self.record("open");
        self.inner.open(path, flags, mode).await
    }

    async fn close(&self, fh: FileHandle) -> std::io::Result<()> {
        self.record("close");
        self.inner.close(fh).await
    }

    async fn pread(&self, fh: FileHandle, size: usize, offset: u64) -> std::io::Result<Bytes> {
        self.record("pread");
        self.inner.pread(fh, size, offset).await
    }

    async fn pwrite(&self, fh: FileHandle, data: &[u8], offset: u64) -> std::io::Result<u64> {
        self.record("pwrite");
        self.inner.pwrite(fh, data, offset).await
    }

    async fn swrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        stride_length: u64,
        stride_skip: u64,
        offset: u64,
    ) -> std::io::Result<u64> {
        self.record("swrite");
        self.inner
            .swrite(fh, data, stride_length, stride_skip, offset)
            .await
    }

    async fn fsize(&self, fh: FileHandle) -> std::io::Result<u64> {
        self.record("fsize");
        self.inner.fsize(fh).await
    }

    async fn ftruncate(&self, fh: FileHandle, len: u64) -> std::io::Result<()> {
        self.record("ftruncate");
        self.inner.ftruncate(fh, len).await
    }

    async fn truncate(&self, path: &Path, len: u64) -> std::io::Result<()> {
        self.record("truncate");
        self.inner.truncate(path, len).await
    }

    async fn stat(&self, path: &Path) -> std::io::Result<EntryStat> {
        self.record("stat");
        self.inner.stat(path).await
    }

    async fn unlink(&self, path: &Path) -> std::io::Result<()> {
        self.record("unlink");
        self.inner.unlink(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        self.record("rename");
        self.inner.rename(from, to).await
    }

    async fn link(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        self.record("link");
        self.inner.link(from, to).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        self.record("mkdir");
        self.inner.mkdir(path, mode).await
    }

    async fn rmdir(&self, path: &Path) -> std::io::Result<()> {
        self.record("rmdir");
        self.inner.rmdir(path).await
    }

    async fn statfs(&self, path: &Path) -> std::io::Result<FsStats> {
        self.record("statfs");
        self.inner.statfs(path).await
    }

    async fn fstatfs(&self, fh: FileHandle) -> std::io::Result<FsStats> {
        self.record("fstatfs");
        self.inner.fstatfs(fh).await
    }

    async fn read_dir(&self, path: &Path) -> std::io::Result<Vec<DirEntry>> {
        self.record("read_dir");
        self.inner.read_dir(path).await
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
        self.record("put_file");
        self.inner.put_file(path, stream, length, mode, deadline).await
    }

    async fn store(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        self.record("store");
        self.inner.store(path, contents).await
    }

    async fn open_lockable(&self, path: &Path) -> std::io::Result<Self::Lockable> {
        self.record("open_lockable");
        Ok(SwitchableLock {
            inner: self.inner.open_lockable(path).await?,
            fail: Arc::clone(&self.fail_locks),
        })
    }
}
