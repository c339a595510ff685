//! Read-only sync status projection for UIs

use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::manager::{SyncErrorEntry, SyncManager, SyncPhase};
use crate::error::{Error, Result};
use crate::models::{NetworkQuality, NetworkState};
use crate::notify::{Listeners, Subscription};

/// Aggregate view of network, queue and last pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_operations: usize,
    /// When a pass last applied something (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Failures from the most recent completed pass
    pub errors: Vec<SyncErrorEntry>,
    pub failed_operations: usize,
    pub unresolved_conflicts: usize,
    pub network_quality: NetworkQuality,
    pub phase: SyncPhase,
}

/// Composes [`SyncStatus`] and notifies listeners when it changes
pub struct SyncStatusReporter {
    manager: Arc<SyncManager>,
    listeners: Arc<Listeners<SyncStatus>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncStatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatusReporter")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SyncStatusReporter {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self {
            manager,
            listeners: Arc::new(Listeners::new("sync status")),
            watcher: Mutex::new(None),
        }
    }

    /// Current status; no side effects
    pub fn get_sync_status(&self) -> Result<SyncStatus> {
        compose(&self.manager)
    }

    /// Invoke `listener` whenever the composed status changes
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_sync_status_change<F>(&self, listener: F) -> Result<Subscription>
    where
        F: FnMut(SyncStatus) + Send + 'static,
    {
        self.ensure_watcher()?;
        Ok(self.listeners.subscribe(listener))
    }

    fn ensure_watcher(&self) -> Result<()> {
        let mut watcher = self
            .watcher
            .lock()
            .map_err(|_| Error::StoreUnavailable("status watcher lock poisoned".to_string()))?;
        if watcher.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidInput("sync status notifications require a Tokio runtime".to_string())
        })?;
        let sources = Sources {
            network: self.manager.network().watch(),
            queue: self.manager.queue().changes(),
            manager: self.manager.changes(),
        };
        let initial = compose(&self.manager).ok();
        *watcher = Some(runtime.spawn(watch_status(
            Arc::downgrade(&self.manager),
            Arc::clone(&self.listeners),
            sources,
            initial,
        )));
        Ok(())
    }
}

impl Drop for SyncStatusReporter {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

struct Sources {
    network: watch::Receiver<NetworkState>,
    queue: watch::Receiver<u64>,
    manager: watch::Receiver<u64>,
}

async fn watch_status(
    manager: Weak<SyncManager>,
    listeners: Arc<Listeners<SyncStatus>>,
    mut sources: Sources,
    mut last: Option<SyncStatus>,
) {
    loop {
        let changed = tokio::select! {
            changed = sources.network.changed() => changed,
            changed = sources.queue.changed() => changed,
            changed = sources.manager.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };

        match compose(&manager) {
            Ok(status) if last.as_ref() != Some(&status) => {
                listeners.emit(&status);
                last = Some(status);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "Failed to compose sync status"),
        }
    }
}

fn compose(manager: &SyncManager) -> Result<SyncStatus> {
    let network = manager.network().current_state();
    let queue = manager.queue().status()?;
    Ok(SyncStatus {
        is_online: network.is_online,
        is_syncing: queue.is_processing,
        pending_operations: queue.total_pending,
        last_sync_at: manager.last_sync_at()?,
        errors: manager
            .last_run()?
            .map(|run| run.errors)
            .unwrap_or_default(),
        failed_operations: queue.failed,
        unresolved_conflicts: manager.resolver().unresolved()?.len(),
        network_quality: network.quality(),
        phase: manager.phase()?,
    })
}
