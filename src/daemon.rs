use std::path::Path;

use bytesize::ByteSize;
use tokio::select;
use tracing::{debug, error, info, warn};

use quotad::provider::LocalProvider;
use quotad::{RecoverySummary, SpaceManager};

use crate::app_config;

/// Makes sure the storage root exists, creating it (and its parents) if needed.
pub async fn prepare_storage_root(storage_root: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::metadata(storage_root).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!(
                "Storage root '{}' exists and is not a directory.",
                storage_root.display()
            ),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(storage_root).await?;
            info!(path = %storage_root.display(), "Created storage root directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Runs the recovery scan over the whole storage root.
pub async fn initialize(
    config: &app_config::Config,
) -> Result<(SpaceManager<LocalProvider>, Option<RecoverySummary>), std::io::Error> {
    prepare_storage_root(&config.storage_root).await?;
    let provider = LocalProvider::new(&config.storage_root);
    let (manager, summary) = SpaceManager::initialize_with(
        provider,
        Path::new("/"),
        config.allocation.size.as_u64(),
        config.allocation.options(),
    )
    .await?;
    Ok((manager, summary))
}

/// A manager for a tree some other process already initialized.
pub fn attach(config: &app_config::Config) -> SpaceManager<LocalProvider> {
    let provider = LocalProvider::new(&config.storage_root);
    if config.allocation.size.as_u64() == 0 {
        SpaceManager::pass_through(provider)
    } else {
        SpaceManager::attach(provider, config.allocation.options())
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Publishes held accounting state if there is any.
async fn flush_if_needed(manager: &SpaceManager<LocalProvider>) -> Result<(), std::io::Error> {
    if !manager.flush_needed().await {
        return Ok(());
    }
    match manager.flush().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "Lost exclusive access to allocation state.");
            Err(e.into())
        }
        Err(e) => {
            warn!(error = %e, "Periodic flush failed.");
            Ok(())
        }
    }
}

/// Main entry point for the daemon: recover, then publish state periodically until told to stop.
pub async fn serve(config: app_config::Config) -> Result<(), std::io::Error> {
    let (manager, summary) = initialize(&config).await?;
    match summary {
        Some(summary) => info!(
            total = %ByteSize::b(u64::try_from(summary.total_size).unwrap_or_default()),
            in_use = %ByteSize::b(u64::try_from(summary.in_use).unwrap_or_default()),
            "Allocations enforced."
        ),
        None => info!("Allocations disabled."),
    }

    let mut ticker = tokio::time::interval(config.allocation.flush_interval());
    info!(
        root = %config.storage_root.display(),
        "quotad is running. Press Ctrl+C to stop."
    );

    let exit = wait_for_exit();
    tokio::pin!(exit);
    loop {
        select! {
            result = &mut exit => {
                result?;
                break;
            },
            _ = ticker.tick() => flush_if_needed(&manager).await?,
        }
    }

    manager.flush().await?;
    debug!("Flushed allocation state on exit.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_root_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a/b");
        prepare_storage_root(&root).await.unwrap();
        assert!(root.is_dir());
        prepare_storage_root(&root).await.unwrap();
    }

    #[tokio::test]
    async fn storage_root_must_be_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = prepare_storage_root(&file).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }
}
