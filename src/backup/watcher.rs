//! Live change notifications for the watched trees.
//!
//! Every directory gets its own non-recursive subscription. New directories
//! are picked up two ways: immediately when their create notification
//! arrives, and by a periodic re-walk that catches whatever that missed.

use anyhow::{anyhow, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::context::Context;
use super::digest::is_hidden;
use super::{owning_root, Event, WatchedRoot};

type RawEvent = notify::Result<notify::Event>;

struct Registry {
    watcher: RecommendedWatcher,
    registered: HashSet<PathBuf>,
}

/// Directory-level subscriptions to the OS notifier.
///
/// The registry lock is only held while calling into `notify`.
pub struct Subscription {
    registry: Mutex<Registry>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RawEvent>>>,
}

impl Subscription {
    pub fn new() -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: RawEvent| {
            let _ = tx.send(res);
        })?;
        Ok(Self {
            registry: Mutex::new(Registry {
                watcher,
                registered: HashSet::new(),
            }),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Subscribe to `path` itself (not its subdirectories). Returns `false`
    /// when it was already registered.
    pub fn register(&self, path: &Path) -> notify::Result<bool> {
        let mut registry = self.registry.lock();
        if registry.registered.contains(path) {
            return Ok(false);
        }
        registry.watcher.watch(path, RecursiveMode::NonRecursive)?;
        registry.registered.insert(path.to_path_buf());
        Ok(true)
    }

    /// Register `dir` and every non-hidden directory below it. Hidden is
    /// judged relative to `root`. Blocking; returns the number of new
    /// registrations.
    pub fn register_tree(&self, root: &Path, dir: &Path) -> usize {
        let mut added = 0;
        let walker = WalkDir::new(dir).follow_links(false).into_iter();
        let dirs = walker.filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            entry.file_type().is_dir() && !is_hidden(relative)
        });

        for entry in dirs {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            match self.register(entry.path()) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to watch directory"),
            }
        }
        added
    }

    /// Forget directories that no longer exist, so a re-created directory
    /// is registered again. Returns the number dropped. Blocking.
    pub fn prune(&self) -> usize {
        // stat outside the lock; the notifier callback and the forwarder
        // must not wait on a full sweep
        let snapshot: Vec<PathBuf> = self.registry.lock().registered.iter().cloned().collect();
        let gone: Vec<PathBuf> = snapshot.into_iter().filter(|path| !path.is_dir()).collect();
        if gone.is_empty() {
            return 0;
        }

        let mut registry = self.registry.lock();
        let mut dropped = 0;
        for path in &gone {
            // re-created while we were looking
            if path.is_dir() {
                continue;
            }
            // the OS usually dropped the watch along with the directory
            let _ = registry.watcher.unwatch(path);
            if registry.registered.remove(path) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop `path` and every registered directory below it. Returns the
    /// number of subscriptions dropped.
    pub fn forget(&self, path: &Path) -> usize {
        let mut registry = self.registry.lock();
        let doomed: Vec<PathBuf> = registry
            .registered
            .iter()
            .filter(|registered| registered.starts_with(path))
            .cloned()
            .collect();
        for dir in &doomed {
            let _ = registry.watcher.unwatch(dir);
            registry.registered.remove(dir);
        }
        doomed.len()
    }

    /// Subscribe to `dir` and its subdirectories afresh, even when they are
    /// registered already: a directory replaced under the same path has lost
    /// its OS watch. Blocking.
    pub fn rewatch_tree(&self, root: &Path, dir: &Path) -> usize {
        self.forget(dir);
        self.register_tree(root, dir)
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.registry.lock().registered.contains(path)
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().registered.len()
    }

    /// The notification stream. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<RawEvent>> {
        self.events.lock().take()
    }

    /// Drop every subscription
    pub fn unregister(&self) {
        let mut registry = self.registry.lock();
        let paths: Vec<PathBuf> = registry.registered.drain().collect();
        for path in paths {
            let _ = registry.watcher.unwatch(&path);
        }
    }
}

/// Notification kinds that mean "this path was created or written"
fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Split a notification into paths that went away and paths that were
/// created or written. A paired rename carries `[from, to]`.
fn split_event(event: notify::Event) -> (Vec<PathBuf>, Vec<PathBuf>) {
    match event.kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            (event.paths, Vec::new())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut gone = event.paths;
            let written = gone.split_off(gone.len().min(1));
            (gone, written)
        }
        kind if is_write_event(&kind) => (Vec::new(), event.paths),
        _ => (Vec::new(), Vec::new()),
    }
}

pub struct LiveWatcher {
    ctx: Context,
    roots: Arc<[WatchedRoot]>,
    subscription: Arc<Subscription>,
    queue: mpsc::Sender<Event>,
}

impl LiveWatcher {
    pub fn new(
        ctx: Context,
        roots: Arc<[WatchedRoot]>,
        subscription: Arc<Subscription>,
        queue: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            ctx,
            roots,
            subscription,
            queue,
        }
    }

    /// Register every root, then forward notifications and re-walk for new
    /// directories until cancelled.
    pub async fn run(self) -> Result<()> {
        let events = self
            .subscription
            .events()
            .ok_or_else(|| anyhow!("notification stream already taken"))?;

        let registered = self.refresh().await;
        info!(
            roots = self.roots.len(),
            directories = registered,
            "Live watcher started"
        );

        tokio::join!(self.refresh_loop(), self.forward(events));

        self.subscription.unregister();
        info!("Live watcher stopped");
        Ok(())
    }

    /// Re-walk every root, registering directories not yet watched
    async fn refresh(&self) -> usize {
        let pruned = self.on_subscription(Subscription::prune).await.unwrap_or(0);
        if pruned > 0 {
            debug!(pruned, "dropped vanished directories");
        }

        let mut added = 0;
        for root in self.roots.iter() {
            let path = root.path.clone();
            added += self
                .on_subscription(move |sub| sub.register_tree(&path, &path))
                .await
                .unwrap_or(0);
        }
        added
    }

    /// Registry work walks and stats the tree, so it runs off the runtime
    async fn on_subscription<T, F>(&self, task: F) -> Option<T>
    where
        F: FnOnce(&Subscription) -> T + Send + 'static,
        T: Send + 'static,
    {
        let subscription = self.subscription.clone();
        match tokio::task::spawn_blocking(move || task(&subscription)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "directory registration task failed");
                None
            }
        }
    }

    async fn refresh_loop(&self) {
        let cancel = self.ctx.cancel_token();
        loop {
            let interval = self.ctx.settings().config.refresh_interval;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let added = self.refresh().await;
            if added > 0 {
                info!(added, "Registered new directories");
            }
        }
    }

    async fn forward(&self, mut events: mpsc::UnboundedReceiver<RawEvent>) {
        let cancel = self.ctx.cancel_token();
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = events.recv() => match res {
                    Some(res) => res,
                    None => break,
                },
            };

            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "notifier error");
                    continue;
                }
            };

            let (gone, written) = split_event(event);

            for path in gone {
                if owning_root(&self.roots, &path).is_none() {
                    continue;
                }
                let target = path.clone();
                let dropped = self
                    .on_subscription(move |sub| sub.forget(&target))
                    .await
                    .unwrap_or(0);
                if dropped > 0 {
                    debug!(path = %path.display(), dropped, "directory removed, subscriptions dropped");
                }
            }

            for path in written {
                let Some(root) = owning_root(&self.roots, &path) else {
                    continue;
                };

                match tokio::fs::metadata(&path).await {
                    Ok(metadata) if metadata.is_dir() => {
                        let root_path = root.path.clone();
                        let dir = path.clone();
                        let added = self
                            .on_subscription(move |sub| sub.rewatch_tree(&root_path, &dir))
                            .await
                            .unwrap_or(0);
                        debug!(path = %path.display(), added, "watching new directory tree");
                        continue;
                    }
                    Ok(_) => {}
                    // gone again before we got to it
                    Err(_) => continue,
                }

                // a full queue blocks here until a dispatcher worker frees a slot
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = self.queue.send(path) => {
                        if sent.is_err() {
                            debug!("event queue closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
