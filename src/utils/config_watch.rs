use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::Config;
use crate::backup::Settings;

/// Watch the config file and republish validated settings whenever it is
/// created or written. The directory is watched rather than the file so that
/// editors replacing the file atomically are still picked up.
pub fn spawn_config_watcher(
    path: &Path,
    publisher: watch::Sender<Arc<Settings>>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("resolving config file {}", path.display()))?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .context("creating config watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching config directory {}", dir.display()))?;

    info!(config = %path.display(), "Watching config file for changes");

    Ok(tokio::spawn(async move {
        // keeps the OS subscription alive for the lifetime of the task
        let _watcher = watcher;
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = rx.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
            };

            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "config watcher error");
                    continue;
                }
            };

            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            if !event.paths.iter().any(|p| p.file_name() == path.file_name()) {
                continue;
            }

            debug!(config = %path.display(), "config file changed");
            match reload(&path) {
                Ok(settings) => {
                    if publisher.send(Arc::new(settings)).is_err() {
                        break;
                    }
                    info!(config = %path.display(), "Configuration reloaded");
                }
                Err(e) => error!(error = %format!("{e:#}"), "Error reloading config"),
            }
        }
        debug!("config watcher stopped");
    }))
}

fn reload(path: &Path) -> Result<Settings> {
    let config = Config::load(Some(path))?;
    Settings::new(config)
}
