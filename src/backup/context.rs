use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::classify::Classifier;
use crate::utils::config::Config;

/// A validated configuration snapshot plus everything derived from it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    pub classifier: Classifier,
}

impl Settings {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::new(
            &config.compress.image_extensions,
            &config.compress.prefix,
        )
        .context("compiling image classifier")?;
        Ok(Self { config, classifier })
    }
}

/// Handed to every component at construction: the current settings (which a
/// config reload may replace) and the process-wide shutdown signal.
#[derive(Debug, Clone)]
pub struct Context {
    settings: watch::Receiver<Arc<Settings>>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(settings: Settings, cancel: CancellationToken) -> (Self, watch::Sender<Arc<Settings>>) {
        let (tx, rx) = watch::channel(Arc::new(settings));
        (
            Self {
                settings: rx,
                cancel,
            },
            tx,
        )
    }

    /// Latest published settings
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.borrow().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
impl Context {
    /// Context with a fresh token whose settings never change
    pub(crate) fn for_tests(config: Config) -> Self {
        let settings = Settings::new(config).expect("valid test config");
        let (ctx, _publisher) = Self::new(settings, CancellationToken::new());
        ctx
    }
}
