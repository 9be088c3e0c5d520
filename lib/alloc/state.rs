//! Cached allocation records and the cross-process locking protocol around them.
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use super::record::{AllocationRecord, marker_path};
use super::resolve::RootResolver;
use crate::error::{AllocError, io_to_errno};
use crate::io::parent_dir;
use crate::provider::{LockableFile as _, StorageProvider};

struct CachedRecord<L> {
    record: AllocationRecord,
    /// Held locked for as long as the record is cached.
    marker: L,
}

/// Records for every root this process currently holds locked.
///
/// Records are addressed by root path, never by reference: loading one root may flush every other
/// record on lock contention, so callers re-resolve through [`charge`](Self::charge) and friends,
/// which reload evicted records transparently.
pub struct StateCache<P: StorageProvider> {
    provider: P,
    records: FxHashMap<PathBuf, CachedRecord<P::Lockable>>,
    resolver: RootResolver,
    recovering: bool,
    last_flush: Option<SystemTime>,
    /// Root and errno of the first lock that could not be acquired.
    poisoned: Option<(PathBuf, i32)>,
}

impl<P: StorageProvider> StateCache<P> {
    /// An empty cache over `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            records: FxHashMap::default(),
            resolver: RootResolver::new(),
            recovering: false,
            last_flush: None,
            poisoned: None,
        }
    }

    /// While set, every record loaded starts from zero usage so a scan can rebuild it.
    pub fn set_recovering(&mut self, recovering: bool) {
        self.recovering = recovering;
    }

    /// Fails with the first lock failure this cache ever saw.
    ///
    /// Accounting cannot continue safely once exclusive access to a marker was lost.
    pub fn check_usable(&self) -> Result<(), AllocError> {
        match &self.poisoned {
            Some((root, errno)) => Err(AllocError::LockFailed {
                root: root.clone(),
                source: std::io::Error::from_raw_os_error(*errno),
            }),
            None => Ok(()),
        }
    }

    /// Load the record governing the directory `dir` itself, returning its root.
    pub async fn load_exact(&mut self, dir: &Path) -> Result<PathBuf, AllocError> {
        let root = self
            .resolver
            .resolve(&self.provider, dir)
            .await?
            .ok_or_else(|| AllocError::NotAnAllocation(dir.to_path_buf()))?;

        if !self.records.contains_key(&root) {
            self.load(&root).await?;
        }
        Ok(root)
    }

    /// Load the record governing the entry at `path`, resolved from the directory holding it.
    pub async fn load_for(&mut self, path: &Path) -> Result<PathBuf, AllocError> {
        self.load_exact(parent_dir(path)).await
    }

    /// The record for `root`, reloading it if a flush evicted it.
    pub async fn ensure(&mut self, root: &Path) -> Result<&AllocationRecord, AllocError> {
        if !self.records.contains_key(root) {
            self.load(root).await?;
        }
        self.records
            .get(root)
            .map(|cached| &cached.record)
            .ok_or_else(|| AllocError::NotAnAllocation(root.to_path_buf()))
    }

    /// Bytes `root` can still take, possibly negative.
    pub async fn available(&mut self, root: &Path) -> Result<i64, AllocError> {
        Ok(self.ensure(root).await?.available())
    }

    /// Charge `delta` bytes to `root` (credit when negative).
    pub async fn charge(&mut self, root: &Path, delta: i64) -> Result<(), AllocError> {
        if delta == 0 {
            return Ok(());
        }
        if !self.records.contains_key(root) {
            self.load(root).await?;
        }
        match self.records.get_mut(root) {
            Some(cached) => {
                cached.record.update(delta);
                Ok(())
            }
            None => Err(AllocError::NotAnAllocation(root.to_path_buf())),
        }
    }

    /// The cached record for `root`, if it is currently held.
    #[must_use]
    pub fn cached(&self, root: &Path) -> Option<&AllocationRecord> {
        self.records.get(root).map(|cached| &cached.record)
    }

    async fn load(&mut self, root: &Path) -> Result<(), AllocError> {
        debug!(root = %root.display(), "Locking allocation.");

        let mut marker = match self.provider.open_lockable(&marker_path(root)).await {
            Ok(marker) => marker,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AllocError::NotAnAllocation(root.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let acquired = match marker.try_lock() {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Whoever holds this lock may be waiting on one of ours.
                debug!(root = %root.display(), "Lock blocked; flushing outstanding locks.");
                self.flush_all()?;
                debug!(root = %root.display(), "Locking allocation (retry).");
                marker.lock().await
            }
            Err(e) => Err(e),
        };
        if let Err(source) = acquired {
            error!(root = %root.display(), error = %source, "Failed to lock allocation.");
            self.poisoned
                .get_or_insert_with(|| (root.to_path_buf(), io_to_errno(&source)));
            return Err(AllocError::LockFailed {
                root: root.to_path_buf(),
                source,
            });
        }

        let contents = marker.read_contents()?;
        let mut record = AllocationRecord::parse(root, &contents)?;
        if self.recovering {
            record.reset_usage();
        }

        self.records.insert(
            root.to_path_buf(),
            CachedRecord { record, marker },
        );
        Ok(())
    }

    /// Persist every dirty record, release every lock, and forget every resolved root.
    ///
    /// Keeps going past a failed write so that every lock is still released; the first failure is
    /// returned.
    pub fn flush_all(&mut self) -> Result<(), AllocError> {
        debug!(records = self.records.len(), "Flushing allocation states.");

        let mut first_error = None;
        for (root, mut cached) in self.records.drain() {
            if cached.record.is_dirty() {
                debug!(root = %root.display(), in_use = cached.record.in_use(), "Storing allocation.");
                if let Err(e) = cached.marker.rewrite(cached.record.to_marker().as_bytes()) {
                    warn!(root = %root.display(), error = %e, "Failed to store allocation.");
                    first_error.get_or_insert(AllocError::Provider(e));
                }
            } else {
                debug!(root = %root.display(), "Freeing allocation.");
            }
        }

        self.resolver.clear();
        self.last_flush = Some(SystemTime::now());
        first_error.map_or(Ok(()), Err)
    }

    /// Whether a flush has work to do: records to publish, or a lock failure to report.
    #[must_use]
    pub fn flush_needed(&self) -> bool {
        !self.records.is_empty() || self.poisoned.is_some()
    }

    /// When [`flush_all`](Self::flush_all) last ran.
    #[must_use]
    pub fn last_flush(&self) -> Option<SystemTime> {
        self.last_flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LocalProvider;

    fn tree(markers: &[(&str, &str)]) -> (tempfile::TempDir, LocalProvider) {
        let tmp = tempfile::tempdir().unwrap();
        for (dir, contents) in markers {
            let host = tmp.path().join(dir.trim_start_matches('/'));
            std::fs::create_dir_all(&host).unwrap();
            std::fs::write(host.join(".__alloc"), contents).unwrap();
        }
        let provider = LocalProvider::new(tmp.path());
        (tmp, provider)
    }

    #[tokio::test]
    async fn load_for_resolves_from_parent() {
        let (_tmp, provider) = tree(&[("/", "65536 0\n"), ("/sub", "4096 0\n")]);
        let mut cache = StateCache::new(provider);

        assert_eq!(cache.load_for(Path::new("/sub")).await.unwrap(), PathBuf::from("/"));
        assert_eq!(
            cache.load_exact(Path::new("/sub")).await.unwrap(),
            PathBuf::from("/sub")
        );
        assert_eq!(
            cache.load_for(Path::new("/sub/file")).await.unwrap(),
            PathBuf::from("/sub")
        );
        assert!(cache.flush_needed());
    }

    #[tokio::test]
    async fn outside_any_root_is_not_an_allocation() {
        let (tmp, provider) = tree(&[]);
        std::fs::create_dir(tmp.path().join("plain")).unwrap();
        let mut cache = StateCache::new(provider);

        let err = cache.load_exact(Path::new("/plain")).await.unwrap_err();
        assert!(matches!(err, AllocError::NotAnAllocation(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn flush_persists_dirty_records() {
        let (tmp, provider) = tree(&[("/", "65536 0\n")]);
        let mut cache = StateCache::new(provider);

        let root = cache.load_exact(Path::new("/")).await.unwrap();
        cache.charge(&root, 12288).await.unwrap();
        cache.flush_all().unwrap();

        assert!(!cache.flush_needed());
        assert!(cache.last_flush().is_some());
        let persisted = std::fs::read_to_string(tmp.path().join(".__alloc")).unwrap();
        assert_eq!(persisted, "65536\n12288\n");

        let record = cache.ensure(&root).await.unwrap();
        assert_eq!((record.total_size(), record.in_use()), (65536, 12288));
    }

    #[tokio::test]
    async fn clean_records_are_not_rewritten() {
        let (tmp, provider) = tree(&[("/", "65536 4096")]);
        let mut cache = StateCache::new(provider);

        cache.load_exact(Path::new("/")).await.unwrap();
        cache.flush_all().unwrap();

        let persisted = std::fs::read_to_string(tmp.path().join(".__alloc")).unwrap();
        assert_eq!(persisted, "65536 4096", "untouched marker keeps its original text");
    }

    #[tokio::test]
    async fn recovery_mode_zeroes_usage() {
        let (_tmp, provider) = tree(&[("/", "65536 40960\n")]);
        let mut cache = StateCache::new(provider);
        cache.set_recovering(true);

        let root = cache.load_exact(Path::new("/")).await.unwrap();
        let record = cache.cached(&root).unwrap();
        assert_eq!(record.in_use(), 0);
        assert!(record.is_dirty());
    }

    #[tokio::test]
    async fn charge_reloads_evicted_record() {
        let (tmp, provider) = tree(&[("/", "65536 0\n")]);
        let mut cache = StateCache::new(provider);

        let root = cache.load_exact(Path::new("/")).await.unwrap();
        cache.charge(&root, 4096).await.unwrap();
        cache.flush_all().unwrap();
        cache.charge(&root, 4096).await.unwrap();
        cache.flush_all().unwrap();

        let persisted = std::fs::read_to_string(tmp.path().join(".__alloc")).unwrap();
        assert_eq!(persisted, "65536\n8192\n");
    }

    #[tokio::test]
    async fn corrupt_marker_is_reported() {
        let (_tmp, provider) = tree(&[("/", "lots\n")]);
        let mut cache = StateCache::new(provider);

        let err = cache.load_exact(Path::new("/")).await.unwrap_err();
        assert!(matches!(err, AllocError::CorruptMarker { .. }), "got {err:?}");
        assert!(!cache.flush_needed());
    }
}
