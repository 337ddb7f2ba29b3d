use anyhow::{Context as _, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use backup_watch::backup::{
    Builder, Context, Dispatcher, ImageMagick, Janitor, LiveWatcher, Settings, Subscription,
    WatchedRoot,
};
use backup_watch::utils::config::{default_config_path, Config};
use backup_watch::utils::config_watch::spawn_config_watcher;
use backup_watch::utils::disk::verify_backup_root;
use backup_watch::utils::logging::{init_tracing, APP_NAME};

#[derive(Parser, Debug)]
#[command(
    name = "backup-watch",
    version,
    about = "Mirror directory trees onto a backup drive, live and by periodic reconciliation"
)]
struct Cli {
    /// Config file (YAML or TOML); defaults to <config dir>/backup-watch/config.yml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug level logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(cli.debug || config.debug, config.log_file.as_deref())?;

    let span = info_span!("app", app = APP_NAME);
    run(cli, config).instrument(span).await
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());

    let config_path = cli.config.or_else(default_config_path);
    let cancel = CancellationToken::new();
    let (ctx, publisher) = Context::new(Settings::new(config)?, cancel.clone());
    let config = ctx.settings().config.clone();

    // The drive may be mounted later; live copies create what they need
    if let Err(e) = verify_backup_root(&config.backup_root).await {
        warn!(error = %format!("{e:#}"), "Backup root not ready");
    }

    let roots = config
        .paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            WatchedRoot::resolve(index, path)
                .with_context(|| format!("resolving watched root {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let roots: Arc<[WatchedRoot]> = roots.into();
    for root in roots.iter() {
        info!(index = root.index, path = %root.path.display(), "Watching root");
    }
    if roots.len() > 1 && !config.nest_root_name {
        warn!("Several roots share one mirrored tree; enable nest_root_name to keep them apart");
    }

    let transcoder = ImageMagick::new();
    if config.compress.enabled {
        match transcoder.check_available().await {
            Ok(version) => info!(%version, "Image compression enabled"),
            Err(e) => warn!(error = %e, "ImageMagick unavailable, images will be copied as is"),
        }
    }
    let builder = Builder::new(ctx.clone(), Arc::new(transcoder));

    let subscription = Arc::new(Subscription::new().context("creating filesystem notifier")?);
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);

    let dispatcher = tokio::spawn(
        Dispatcher::new(ctx.clone(), roots.clone(), builder.clone(), queue_rx).run(config.workers),
    );
    let watcher = tokio::spawn(
        LiveWatcher::new(ctx.clone(), roots.clone(), subscription, queue_tx).run(),
    );
    let janitor = tokio::spawn(Janitor::new(ctx.clone(), roots, builder).run());

    let config_watcher = match config_path.filter(|path| path.is_file()) {
        Some(path) => match spawn_config_watcher(&path, publisher, cancel.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Config hot reload disabled");
                None
            }
        },
        None => None,
    };

    shutdown_signal().await;
    cancel.cancel();

    match watcher.await {
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "Live watcher failed"),
        Err(e) => error!(error = %e, "Live watcher panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatcher panicked");
    }
    if let Err(e) = janitor.await {
        error!(error = %e, "Janitor panicked");
    }
    if let Some(handle) = config_watcher {
        let _ = handle.await;
    }

    info!("Stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
