//! Configuration file watcher for hot reload.
//!
//! A reload never mutates a running proxy: each accepted config is turned
//! into a fresh proxy instance by the caller, and in-flight requests finish
//! on the instance they started with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// Watches one config file and emits every valid new version.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    ///
    /// The parent directory is watched so editors that replace the file
    /// atomically are still picked up.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !relevant {
                        return;
                    }
                    match load_config(&path) {
                        Ok(config) => {
                            tracing::info!(path = %path.display(), "Config change accepted");
                            let _ = tx.send(config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Rejected config change; keeping current proxy");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
