//! Notify-based hot reload of the runtime override file.
//!
//! - Watches a single JSON file using notify::RecommendedWatcher.
//! - On create/modify events, re-parses the file and swaps the override
//!   snapshot. A file that fails to load leaves the previous snapshot live.

use crate::errors::FaultError;
use crate::runtime::SnapshotRuntime;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the override file and reload `runtime` whenever it changes.
///
/// Runs until the watcher's event channel closes.
pub async fn watch_runtime_file(
    path: PathBuf,
    runtime: Arc<SnapshotRuntime>,
) -> Result<(), notify::Error> {
    // Bridges the watcher's own thread into this task.
    let (tx, mut rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send runtime file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("Watching runtime overrides for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event) {
                    info!(
                        "Runtime override change detected. Event: {:?}. Reloading.",
                        event.kind
                    );
                    reload_runtime(&path, &runtime).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => error!("Error watching runtime override file: {}", e),
        }
    }

    warn!("Runtime override watcher is shutting down.");
    Ok(())
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    )
}

/// Reload overrides, keeping the current snapshot on any failure.
pub async fn reload_runtime(path: &Path, runtime: &SnapshotRuntime) -> bool {
    match runtime.reload_from_file(path).await {
        Ok(count) => {
            info!(
                "Runtime overrides reloaded from '{}' ({} keys)",
                path.display(),
                count
            );
            true
        }
        Err(FaultError::FileSystemError(io_err)) => {
            error!(
                "Failed to read runtime overrides '{}': {}. Keeping old overrides.",
                path.display(),
                io_err
            );
            false
        }
        Err(FaultError::JsonError(json_err)) => {
            error!(
                "Failed to parse runtime overrides '{}': {}. Keeping old overrides.",
                path.display(),
                json_err
            );
            false
        }
        Err(e) => {
            error!(
                "Runtime overrides '{}' rejected: {}. Keeping old overrides.",
                path.display(),
                e
            );
            false
        }
    }
}
