//! Background workers owned by a client.
//!
//! - Queue drainer: replays the offline queue when connectivity comes back
//!   and every `drain_interval_ms`
//! - Config watcher: reloads the configuration file when it changes

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::config::{load_config, ConfigError};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

impl Client {
    /// Start the queue drainer. It stops when `shutdown` fires.
    pub fn spawn_background(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut online = client.connectivity().subscribe();
            tracing::info!("Queue drainer started");

            loop {
                let interval = Duration::from_millis(client.config().queue.drain_interval_ms.max(1));
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("Queue drainer stopping");
                        break;
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *online.borrow_and_update();
                        if is_online {
                            client.drain_logged("reconnect").await;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        client.drain_logged("interval").await;
                    }
                }
            }
        })
    }

    /// Reload from `path` whenever the file changes, until `shutdown` fires.
    /// The parent directory is watched so editors that replace the file on
    /// save are still seen; a burst of events within the debounce window
    /// triggers one reload.
    pub fn watch_config(
        &self,
        path: &Path,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, notify::Error> {
        let path = path.to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let (tx, mut changes) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let touched = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == file_name.as_deref());
                    if touched && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");

        let client = self.clone();
        Ok(tokio::spawn(async move {
            // Event delivery stops when the watcher is dropped.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                        while let Ok(Some(())) = tokio::time::timeout(RELOAD_DEBOUNCE, changes.recv()).await {}
                        if let Err(e) = client.reload_config_file(&path) {
                            tracing::error!(
                                path = ?path,
                                error = %e,
                                "Rejected config reload, keeping current configuration"
                            );
                        }
                    }
                }
            }
            tracing::info!("Config watcher stopped");
        }))
    }

    /// Load, validate and apply the configuration stored at `path`.
    pub fn reload_config_file(&self, path: &Path) -> Result<(), ConfigError> {
        let config = load_config(path)?;
        self.reload_config(config).map_err(ConfigError::Validation)
    }

    async fn drain_logged(&self, trigger: &'static str) {
        match self.process_queue().await {
            Ok(report) if report.busy => {
                tracing::debug!(trigger, "Drain already running");
            }
            Ok(report) => {
                if !report.is_empty() {
                    tracing::debug!(trigger, replayed = report.replayed.len(), "Drain finished");
                }
            }
            Err(e) => tracing::error!(trigger, error = %e, "Queue drain failed"),
        }
    }
}
