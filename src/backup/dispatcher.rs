use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::builder::{is_partial_copy, Builder};
use super::context::Context;
use super::digest::WalkFilter;
use super::{owning_root, Event, WatchedRoot};

/// Pool of symmetric workers draining the live event queue into the Builder.
///
/// Workers share one receiver; the lock is held for a single `recv` only, so
/// materialization runs fully in parallel.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Context,
    roots: Arc<[WatchedRoot]>,
    builder: Builder,
    queue: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl Dispatcher {
    pub fn new(
        ctx: Context,
        roots: Arc<[WatchedRoot]>,
        builder: Builder,
        queue: mpsc::Receiver<Event>,
    ) -> Self {
        Self {
            ctx,
            roots,
            builder,
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Run `workers` workers until cancellation or until every producer is
    /// gone, then wait for all of them.
    pub async fn run(self, workers: usize) {
        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker_id| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.worker_loop(worker_id).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher worker panicked");
            }
        }
        info!("Dispatcher stopped");
    }

    async fn worker_loop(&self, worker_id: usize) {
        info!("Worker {} started", worker_id);
        let cancel = self.ctx.cancel_token();

        loop {
            let next = {
                let mut queue = tokio::select! {
                    _ = cancel.cancelled() => break,
                    queue = self.queue.lock() => queue,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    path = queue.recv() => path,
                }
            };

            match next {
                Some(path) => self.handle(worker_id, &path).await,
                None => {
                    debug!("Worker {} channel closed", worker_id);
                    break;
                }
            }
        }

        info!("Worker {} shutting down", worker_id);
    }

    async fn handle(&self, worker_id: usize, path: &Path) {
        let Some(root) = owning_root(&self.roots, path) else {
            debug!(worker_id, path = %path.display(), "event outside watched roots");
            return;
        };

        // re-stat: the event only says something happened
        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_dir() => return,
            Ok(_) => {}
            Err(_) => {
                debug!(worker_id, path = %path.display(), "path vanished before dispatch");
                return;
            }
        }

        let settings = self.ctx.settings();
        let relative = path.strip_prefix(&root.path).unwrap_or(path);
        if is_partial_copy(path) || !WalkFilter::source(&settings.config).admits(relative) {
            return;
        }

        let kind = settings.classifier.classify(path);
        match self.builder.materialize(root, path, kind).await {
            Ok(dst) => debug!(worker_id, src = %path.display(), dst = %dst.display(), "live copy done"),
            Err(e) => error!(worker_id, path = %path.display(), error = %e, "live copy failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::transcode::fake::FakeTranscoder;
    use crate::utils::config::Config;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use walkdir::WalkDir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: WatchedRoot,
        backup_dir: PathBuf,
        dispatcher: Dispatcher,
        tx: mpsc::Sender<Event>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(base.join("src")).unwrap();
        let root = WatchedRoot::resolve(0, &base.join("src")).unwrap();
        let ctx = Context::for_tests(Config {
            paths: vec![root.path.clone()],
            backup_root: base.join("drive"),
            workers: 3,
            ..Config::default()
        });
        let builder = Builder::new(ctx.clone(), Arc::new(FakeTranscoder::new(100)));
        let (tx, rx) = mpsc::channel(4);
        Fixture {
            backup_dir: base.join("drive/backup_test"),
            dispatcher: Dispatcher::new(ctx, Arc::from(vec![root.clone()]), builder, rx),
            root,
            tx,
            _dir: dir,
        }
    }

    fn files_under(dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[tokio::test]
    async fn test_workers_materialize_each_event_once() {
        let fx = fixture();
        let handle = tokio::spawn(fx.dispatcher.clone().run(3));

        let mut events = Vec::new();
        for i in 0..12 {
            let dir = fx.root.path.join(format!("d{}", i % 3));
            fs::create_dir_all(&dir).unwrap();
            let file = dir.join(format!("f{i}.txt"));
            fs::write(&file, format!("content {i}")).unwrap();
            events.push(file);
        }
        // duplicates are harmless
        events.push(events[0].clone());
        events.push(events[5].clone());

        for path in events {
            fx.tx.send(path).await.unwrap();
        }
        drop(fx.tx);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("workers exit once the queue closes")
            .unwrap();
        assert_eq!(files_under(&fx.backup_dir), 12);
        assert!(fx.backup_dir.join("d1/f4.txt").is_file());
    }

    #[tokio::test]
    async fn test_skips_directories_vanished_hidden_and_ignored() {
        let fx = fixture();
        let handle = tokio::spawn(fx.dispatcher.clone().run(2));

        let nested = fx.root.path.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(fx.root.path.join(".secret"), b"x").unwrap();
        fs::write(fx.root.path.join("draft.tmp"), b"x").unwrap();
        fs::write(fx.root.path.join("keep.txt"), b"x").unwrap();

        for path in [
            nested,
            fx.root.path.join("gone.txt"),
            fx.root.path.join(".secret"),
            fx.root.path.join("draft.tmp"),
            PathBuf::from("/elsewhere/file.txt"),
            fx.root.path.join("keep.txt"),
        ] {
            fx.tx.send(path).await.unwrap();
        }
        drop(fx.tx);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(files_under(&fx.backup_dir), 1);
        assert!(fx.backup_dir.join("keep.txt").is_file());
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let fx = fixture();
        let cancel = fx.dispatcher.ctx.cancel_token().clone();
        let handle = tokio::spawn(fx.dispatcher.clone().run(4));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("workers exit on cancellation")
            .unwrap();
        // the sender is still alive; only the token stopped them
        assert!(!fx.tx.is_closed());
    }
}
