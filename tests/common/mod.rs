#![allow(dead_code, missing_docs, clippy::unwrap_used)]

pub mod counting_provider;

use std::path::{Path, PathBuf};

use quotad::provider::LocalProvider;
use quotad::{AllocOptions, RecoverySummary, SpaceManager};
use tempfile::TempDir;

/// A temporary storage root exported through a [`LocalProvider`].
pub struct Fixture {
    pub tmp: TempDir,
    pub provider: LocalProvider,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(tmp.path());
        Self { tmp, provider }
    }

    /// Host location of a virtual path.
    pub fn host(&self, path: &str) -> PathBuf {
        self.tmp.path().join(path.trim_start_matches('/'))
    }

    /// Create a file of `len` bytes directly on the host, bypassing accounting.
    pub fn put(&self, path: &str, len: usize) {
        let host = self.host(path);
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(host, vec![b'x'; len]).unwrap();
    }

    /// Create a directory directly on the host.
    pub fn dir(&self, path: &str) {
        std::fs::create_dir_all(self.host(path)).unwrap();
    }

    /// Write a marker directly on the host, turning `dir` into a quota root.
    pub fn marker(&self, dir: &str, contents: &str) {
        self.dir(dir);
        std::fs::write(self.host(dir).join(".__alloc"), contents).unwrap();
    }

    /// `(total, in_use)` as persisted in the marker of `dir`.
    pub fn persisted(&self, dir: &str) -> (i64, i64) {
        let contents = std::fs::read_to_string(self.host(dir).join(".__alloc")).unwrap();
        let mut fields = contents.split_ascii_whitespace().map(|f| f.parse().unwrap());
        (fields.next().unwrap(), fields.next().unwrap())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.host(path).exists()
    }

    pub fn len(&self, path: &str) -> u64 {
        std::fs::metadata(self.host(path)).unwrap().len()
    }

    /// Initialize allocations of `size` bytes at the storage root.
    pub async fn initialize(&self, size: u64) -> (SpaceManager<LocalProvider>, RecoverySummary) {
        let (manager, summary) =
            SpaceManager::initialize(self.provider.clone(), Path::new("/"), size)
                .await
                .unwrap();
        (manager, summary.unwrap())
    }

    /// A second manager over the same tree, as another server process would have.
    pub fn attach(&self) -> SpaceManager<LocalProvider> {
        SpaceManager::attach(
            LocalProvider::new(self.tmp.path()),
            AllocOptions::default(),
        )
    }
}

/// `(total, in_use)` of the allocation governing `dir`, as the manager sees it.
pub async fn usage(manager: &SpaceManager<LocalProvider>, dir: &str) -> (i64, i64) {
    let info = manager.query_info(Path::new(dir)).await.unwrap();
    (info.total_size, info.in_use)
}
