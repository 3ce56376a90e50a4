//! Background detection of versions committed by other processes.
//!
//! Without a watcher, a process only notices foreign commits when one of its
//! handles refreshes or begins a write. The watcher polls the version stamp on
//! a tokio task and imports new versions as soon as they appear, which
//! schedules `ExternalChange` deliveries and auto-refreshes like a local
//! commit would.

use crate::connection::Database;
use crate::core::{DbError, Result};
use crate::facade::shared_file::SharedFile;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tokio::time::sleep;
use tracing::{Level, event};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct ChangeWatcher {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Signals the watcher to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DbError::IoError(format!("change watcher join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Starts polling the file of `db` every `interval`.
///
/// Must be called from within a tokio runtime. Each poll reads the stamp on
/// the blocking pool. The watcher keeps the file's shared state alive, not
/// the handle.
pub fn spawn_change_watcher(db: &Database, interval: Duration) -> Result<ChangeWatcher> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
        DbError::Configuration("spawn_change_watcher requires a tokio runtime".into())
    })?;
    let shared: Arc<SharedFile> = Arc::clone(db.shared()?);
    let interval = interval.max(MIN_INTERVAL);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let join_handle = runtime.spawn(async move {
        event!(Level::DEBUG, path = %shared.path().display(), interval_ms = interval.as_millis() as u64, "change watcher started");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let polled = Arc::clone(&shared);
                    match task::spawn_blocking(move || polled.import_external(false)).await {
                        Ok(Ok(Some(version))) => {
                            event!(Level::DEBUG, path = %shared.path().display(), version = %version, "watcher imported version");
                        }
                        Ok(Ok(None)) => {}
                        Ok(Err(err)) => {
                            event!(Level::WARN, path = %shared.path().display(), error = %err, "change watcher failed to import");
                        }
                        Err(err) => {
                            event!(Level::WARN, path = %shared.path().display(), error = %err, "change watcher import task failed");
                        }
                    }
                }
            }
        }
    });

    Ok(ChangeWatcher {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
