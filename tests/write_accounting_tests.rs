#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::path::Path;

use quotad::AllocError;
use quotad::SpaceManager;
use quotad::provider::OpenFlags;

use common::counting_provider::CountingProvider;
use common::{Fixture, usage};

const RW_CREATE: OpenFlags = OpenFlags::CREAT.union(OpenFlags::RDWR);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_fills_allocation_then_refuses() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(8192).await;

    let fh = manager.open(Path::new("/f"), RW_CREATE, 0o644).await.unwrap();
    let written = manager.write(fh, &[7u8; 4097], 0).await.unwrap();
    assert_eq!(written, 4097);
    assert_eq!(usage(&manager, "/").await, (8192, 8192));

    let err = manager.write(fh, &[1], 8192).await.unwrap_err();
    assert!(
        matches!(err, AllocError::OutOfSpace { needed: 4096, available: 0, .. }),
        "got {err:?}"
    );
    assert_eq!(usage(&manager, "/").await, (8192, 8192));
    assert_eq!(fx.len("/f"), 4097, "refused write must not touch the file");

    manager.close(fh).await.unwrap();
    manager.flush().await.unwrap();
    assert_eq!(fx.persisted("/"), (8192, 8192));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overwrite_within_existing_blocks_is_free() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(8192).await;

    let fh = manager.open(Path::new("/f"), RW_CREATE, 0o644).await.unwrap();
    manager.write(fh, &[0u8; 4096], 0).await.unwrap();
    manager.write(fh, &[1u8; 100], 10).await.unwrap();
    manager.write(fh, &[2u8; 4096], 0).await.unwrap();

    assert_eq!(usage(&manager, "/").await, (8192, 4096));
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_write_performs_no_provider_write() {
    let fx = Fixture::new();
    let provider = CountingProvider::new(fx.provider.clone());
    let (manager, _) = SpaceManager::initialize(provider.clone(), Path::new("/"), 4096)
        .await
        .unwrap();

    let fh = manager.open(Path::new("/f"), RW_CREATE, 0o644).await.unwrap();
    provider.reset();

    let err = manager.write(fh, &[0u8; 4097], 0).await.unwrap_err();
    assert_eq!(i32::from(err), libc::ENOSPC);
    assert_eq!(provider.count("pwrite"), 0);
    assert_eq!(fx.len("/f"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncating_open_credits_old_contents() {
    let fx = Fixture::new();
    fx.put("/f", 10_000);
    let (manager, summary) = fx.initialize(65536).await;
    assert_eq!(summary.in_use, 12288);

    let fh = manager
        .open(Path::new("/f"), OpenFlags::WRONLY | OpenFlags::TRUNC, 0o644)
        .await
        .unwrap();
    assert_eq!(usage(&manager, "/").await, (65536, 0));
    assert_eq!(fx.len("/f"), 0);
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_by_path_and_handle() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(16384).await;

    manager.open(Path::new("/f"), RW_CREATE, 0o644).await.unwrap();
    manager.truncate(Path::new("/f"), 5000).await.unwrap();
    assert_eq!(usage(&manager, "/").await, (16384, 8192));
    assert_eq!(fx.len("/f"), 5000);

    let err = manager.truncate(Path::new("/f"), 20_000).await.unwrap_err();
    assert!(matches!(err, AllocError::OutOfSpace { .. }), "got {err:?}");
    assert_eq!(fx.len("/f"), 5000);

    let fh = manager.open(Path::new("/f"), OpenFlags::RDWR, 0o644).await.unwrap();
    manager.ftruncate(fh, 1).await.unwrap();
    assert_eq!(usage(&manager, "/").await, (16384, 4096));
    manager.ftruncate(fh, 16384).await.unwrap();
    assert_eq!(usage(&manager, "/").await, (16384, 16384));
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlink_credits_space() {
    let fx = Fixture::new();
    fx.put("/a", 1);
    fx.put("/b", 4097);
    let (manager, summary) = fx.initialize(65536).await;
    assert_eq!(summary.in_use, 4096 + 8192);

    manager.unlink(Path::new("/b")).await.unwrap();
    assert_eq!(usage(&manager, "/").await, (65536, 4096));
    assert!(!fx.exists("/b"));

    let err = manager.unlink(Path::new("/missing")).await.unwrap_err();
    assert!(err.is_os_error(libc::ENOENT), "got {err:?}");
    assert_eq!(usage(&manager, "/").await, (65536, 4096));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hard_links_are_refused() {
    let fx = Fixture::new();
    fx.put("/a", 10);
    let (manager, _) = fx.initialize(65536).await;

    let err = manager
        .link(Path::new("/a"), Path::new("/b"))
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::PermissionDenied), "got {err:?}");
    assert_eq!(i32::from(err), libc::EPERM);
    assert!(!fx.exists("/b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strided_write_is_not_accounted() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(4096).await;

    let fh = manager.open(Path::new("/s"), RW_CREATE, 0o644).await.unwrap();
    let written = manager.swrite(fh, &[1u8; 16], 8, 8192, 0).await.unwrap();
    assert_eq!(written, 16);
    assert!(fx.len("/s") > 4096);
    assert_eq!(usage(&manager, "/").await, (4096, 0));
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handles_are_forgotten_on_close() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(8192).await;

    let fh = manager.open(Path::new("/f"), RW_CREATE, 0o644).await.unwrap();
    assert_eq!(manager.tracked_handles(), 1);
    manager.close(fh).await.unwrap();
    assert_eq!(manager.tracked_handles(), 0);

    let err = manager.write(fh, b"late", 0).await.unwrap_err();
    assert!(matches!(err, AllocError::BadHandle(h) if h == fh), "got {err:?}");
    assert_eq!(i32::from(err), libc::EBADF);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_reports_allocation_capacity() {
    let fx = Fixture::new();
    fx.put("/f", 4096);
    let (manager, _) = fx.initialize(16384).await;

    let stats = manager.statfs(Path::new("/f")).await.unwrap();
    assert!(stats.block_size > 0);
    assert_eq!(stats.total_blocks * stats.block_size, 16384);
    assert_eq!(stats.available_blocks * stats.block_size, 12288);
    assert_eq!(stats.free_blocks, stats.available_blocks);

    let fh = manager.open(Path::new("/f"), OpenFlags::RDONLY, 0).await.unwrap();
    let by_handle = manager.fstatfs(fh).await.unwrap();
    assert_eq!(by_handle.total_blocks, stats.total_blocks);
    assert_eq!(by_handle.available_blocks, stats.available_blocks);
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statfs_never_reports_negative_headroom() {
    let fx = Fixture::new();
    fx.put("/big", 20_000);
    let (manager, summary) = fx.initialize(8192).await;
    assert!(summary.available < 0, "tree already exceeds its allocation");

    let stats = manager.statfs(Path::new("/big")).await.unwrap();
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(stats.available_blocks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_inside_overfull_allocation_can_still_shrink() {
    let fx = Fixture::new();
    fx.put("/big", 20_000);
    let (manager, _) = fx.initialize(8192).await;

    manager.truncate(Path::new("/big"), 100).await.unwrap();
    assert_eq!(usage(&manager, "/").await, (8192, 4096));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_writes_are_charged_at_end_of_file() {
    let fx = Fixture::new();
    let (manager, _) = fx.initialize(8192).await;

    let fh = manager
        .open(
            Path::new("/log"),
            OpenFlags::CREAT | OpenFlags::WRONLY | OpenFlags::APPEND,
            0o644,
        )
        .await
        .unwrap();

    // The offset is ignored by append handles; every write grows the file.
    manager.write(fh, &[1u8; 4096], 0).await.unwrap();
    manager.write(fh, &[2u8; 4096], 0).await.unwrap();
    assert_eq!(fx.len("/log"), 8192);
    assert_eq!(usage(&manager, "/").await, (8192, 8192));

    for _ in 0..3 {
        let err = manager.write(fh, &[3u8; 4096], 0).await.unwrap_err();
        assert!(
            matches!(err, AllocError::OutOfSpace { needed: 4096, available: 0, .. }),
            "got {err:?}"
        );
    }
    assert_eq!(fx.len("/log"), 8192, "refused appends must not grow the file");
    assert_eq!(usage(&manager, "/").await, (8192, 8192));
    manager.close(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_to_existing_file_charges_only_growth() {
    let fx = Fixture::new();
    fx.put("/log", 100);
    let (manager, summary) = fx.initialize(16384).await;
    assert_eq!(summary.in_use, 4096);

    let fh = manager
        .open(Path::new("/log"), OpenFlags::WRONLY | OpenFlags::APPEND, 0o644)
        .await
        .unwrap();
    manager.write(fh, &[0u8; 4000], 0).await.unwrap();
    assert_eq!(fx.len("/log"), 4100);
    assert_eq!(usage(&manager, "/").await, (16384, 8192));
    manager.close(fh).await.unwrap();
}
