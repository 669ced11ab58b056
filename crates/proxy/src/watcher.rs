//! Configuration-file watching.
//!
//! When `--exit-on-file-change` is set, any modification of the nsec or
//! relays file flips the shutdown signal; a supervisor is expected to
//! restart the process with the new configuration.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

/// Start watching `paths`; keep the returned watcher alive for as long
/// as watching should continue.
pub fn spawn_file_watcher(
    paths: Vec<PathBuf>,
    shutdown: watch::Sender<bool>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    info!(paths = ?event.paths, "configuration file changed, shutting down");
                    let _ = shutdown.send(true);
                }
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        }
    })
    .context("create file watcher")?;

    for path in paths {
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", path.display()))?;
    }
    Ok(watcher)
}
