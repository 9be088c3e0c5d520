//! The storage backend the allocation layer sits on top of.
//!
//! A provider performs the real I/O for one exported tree (local disk, a networked filesystem,
//! ...). Paths handed to a provider are virtual and absolute within that tree (`/a/b`); how they
//! map onto the backend is the provider's business. Every operation reports POSIX-style failures
//! through [`std::io::Error`] so that `raw_os_error` carries the errno.

/// Provider backed by a directory on the local filesystem.
pub mod local;

pub use local::{LocalLockFile, LocalProvider};

use std::ffi::OsString;
use std::future::Future;
use std::path::Path;

use bitflags::bitflags;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::time::Instant;

/// Type representing an open file handle.
pub type FileHandle = u64;

/// Names starting with this prefix are the serving layer's own bookkeeping, never user data.
pub const PRIVATE_PREFIX: &str = ".__";

/// Whether `name` is reserved for bookkeeping by [`PRIVATE_PREFIX`].
#[must_use]
pub fn is_private_name(name: &std::ffi::OsStr) -> bool {
    name.as_encoded_bytes().starts_with(PRIVATE_PREFIX.as_bytes())
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether the flags ask for write access.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// The type of a directory entry, as far as accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file. Charged by its length.
    File,
    /// A directory. Walked, and charged opaquely if it is a quota root.
    Directory,
    /// Anything else (symlinks, devices, fifos, sockets). Never charged.
    Other,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            Self::File
        } else if ft.is_dir() {
            Self::Directory
        } else {
            Self::Other
        }
    }
}

/// What `stat` reports about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryStat {
    /// The kind of object at the path.
    pub kind: EntryKind,
    /// Logical length in bytes.
    pub size: u64,
}

/// A single entry yielded by [`StorageProvider::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    /// The name of this entry within its parent directory.
    pub name: OsString,
    /// The kind of object the entry names.
    pub kind: EntryKind,
    /// Logical length in bytes.
    pub size: u64,
}

/// Filesystem statistics returned by [`StorageProvider::statfs`].
///
/// Block-related counts are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u64,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u64,
}

/// An open file carrying an advisory, exclusive lock.
///
/// The lock is bound to the lifetime of the value: dropping it releases the lock.
pub trait LockableFile: Send + 'static {
    /// Whether the lock could be taken right now without waiting. Does not keep it.
    ///
    /// Backends without lock support fail with `ENOSYS` or `EOPNOTSUPP`.
    fn test_lock(&self) -> std::io::Result<bool>;

    /// Take the lock if it is free. Returns `false` on contention.
    fn try_lock(&mut self) -> std::io::Result<bool>;

    /// Take the lock, waiting for as long as another holder keeps it.
    fn lock(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Read the whole file as text.
    fn read_contents(&mut self) -> std::io::Result<String>;

    /// Replace the whole file with `contents`.
    fn rewrite(&mut self, contents: &[u8]) -> std::io::Result<()>;
}

/// A storage backend performing the I/O the allocation layer accounts for.
pub trait StorageProvider: Clone + Send + Sync + 'static {
    /// The lockable file type returned by [`open_lockable`](Self::open_lockable).
    type Lockable: LockableFile;

    /// Open (and possibly create) a file.
    fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> impl Future<Output = std::io::Result<FileHandle>> + Send;

    /// Release a handle returned by [`open`](Self::open).
    fn close(&self, fh: FileHandle) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Read up to `size` bytes starting at byte `offset`.
    fn pread(
        &self,
        fh: FileHandle,
        size: usize,
        offset: u64,
    ) -> impl Future<Output = std::io::Result<Bytes>> + Send;

    /// Write `data` at byte `offset`, returning the number of bytes written.
    fn pwrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        offset: u64,
    ) -> impl Future<Output = std::io::Result<u64>> + Send;

    /// Write `data` in `stride_length` pieces, advancing the file offset by `stride_skip` after
    /// each piece. Returns the number of bytes written.
    fn swrite(
        &self,
        fh: FileHandle,
        data: &[u8],
        stride_length: u64,
        stride_skip: u64,
        offset: u64,
    ) -> impl Future<Output = std::io::Result<u64>> + Send;

    /// Current length of an open file.
    fn fsize(&self, fh: FileHandle) -> impl Future<Output = std::io::Result<u64>> + Send;

    /// Set the length of an open file.
    fn ftruncate(
        &self,
        fh: FileHandle,
        len: u64,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Set the length of a file by path.
    fn truncate(&self, path: &Path, len: u64)
    -> impl Future<Output = std::io::Result<()>> + Send;

    /// Describe the object at `path`, following symlinks.
    fn stat(&self, path: &Path) -> impl Future<Output = std::io::Result<EntryStat>> + Send;

    /// Remove a file.
    fn unlink(&self, path: &Path) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Rename `from` to `to`.
    fn rename(&self, from: &Path, to: &Path)
    -> impl Future<Output = std::io::Result<()>> + Send;

    /// Create a hard link `to` pointing at `from`.
    fn link(&self, from: &Path, to: &Path) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Create a directory.
    fn mkdir(&self, path: &Path, mode: u32) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Remove a directory. Entries carrying the private-marker prefix do not keep a directory
    /// from being removed.
    fn rmdir(&self, path: &Path) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Statistics for the filesystem holding `path`.
    fn statfs(&self, path: &Path) -> impl Future<Output = std::io::Result<FsStats>> + Send;

    /// Statistics for the filesystem holding an open file.
    fn fstatfs(&self, fh: FileHandle) -> impl Future<Output = std::io::Result<FsStats>> + Send;

    /// List all entries of a directory, excluding `.` and `..`.
    fn read_dir(&self, path: &Path)
    -> impl Future<Output = std::io::Result<Vec<DirEntry>>> + Send;

    /// Receive exactly `length` bytes from `stream` into a new file at `path`.
    ///
    /// Fails if the stream ends early or `deadline` passes first; whatever was written up to that
    /// point stays on disk for the caller to clean up.
    fn put_file<S>(
        &self,
        path: &Path,
        stream: &mut S,
        length: u64,
        mode: u32,
        deadline: Instant,
    ) -> impl Future<Output = std::io::Result<u64>> + Send
    where
        S: AsyncRead + Unpin + Send;

    /// Create or overwrite a small file with `contents`.
    fn store(&self, path: &Path, contents: &[u8])
    -> impl Future<Output = std::io::Result<()>> + Send;

    /// Open an existing file for reading and writing, unlocked.
    fn open_lockable(
        &self,
        path: &Path,
    ) -> impl Future<Output = std::io::Result<Self::Lockable>> + Send;
}
