//! Background task that decides when to run processing passes

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::manager::{RunDisposition, SyncManager};
use crate::util::now_ms;

/// Handle to the running driver; dropping it aborts the task
#[derive(Debug)]
pub struct SyncDriver {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncDriver {
    pub(crate) fn spawn(manager: Arc<SyncManager>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(run(manager, stopped));
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop after any in-flight pass finishes
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "Sync driver ended abnormally");
            }
        }
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

/// Convert a wall-clock backoff deadline into a timer instant
fn instant_for(deadline_ms: i64) -> Instant {
    let wait = u64::try_from(deadline_ms.saturating_sub(now_ms())).unwrap_or_default();
    Instant::now() + Duration::from_millis(wait)
}

/// Pass triggers:
/// - `debounce` after an offline to online transition (re-armed by each one)
/// - `debounce` after an enqueue while online
/// - the earliest backoff deadline
/// - the periodic interval, when configured
async fn run(manager: Arc<SyncManager>, mut stopped: oneshot::Receiver<()>) {
    let config = manager.config().clone();
    let debounce = config.debounce();
    let interval = config.auto_sync_interval();
    let queue = Arc::clone(manager.queue());
    let mut network = manager.network().watch();

    let mut online = network.borrow_and_update().is_online;
    let has_backlog = !queue.is_empty().unwrap_or(true);
    let mut debounce_at = (online && has_backlog).then(|| Instant::now() + debounce);
    let mut interval_at = interval.map(|period| Instant::now() + period);
    // Backoff deadlines at or before this were already visible to a pass
    let mut attempted_through = i64::MIN;

    tracing::debug!("Sync driver started");
    loop {
        let backoff_at = if online {
            match queue.next_retry_after(attempted_through) {
                Ok(deadline) => deadline.map(instant_for),
                Err(error) => {
                    tracing::error!(%error, "Sync driver cannot read the queue; stopping");
                    break;
                }
            }
        } else {
            None
        };
        let wake = earliest([debounce_at, backoff_at, interval_at.filter(|_| online)]);

        tokio::select! {
            _ = &mut stopped => break,
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_online = network.borrow_and_update().is_online;
                if now_online && !online {
                    debounce_at = Some(Instant::now() + debounce);
                } else if !now_online {
                    debounce_at = None;
                }
                online = now_online;
                continue;
            }
            () = queue.enqueued() => {
                if online && debounce_at.is_none() {
                    debounce_at = Some(Instant::now() + debounce);
                }
                continue;
            }
            () = sleep_until(wake) => {}
        }

        debounce_at = None;
        if interval_at.is_some_and(|at| at <= Instant::now()) {
            interval_at = interval.map(|period| Instant::now() + period);
        }
        attempted_through = now_ms().saturating_sub(1);

        match manager.process_now().await {
            Ok(result) => {
                if result.disposition == RunDisposition::Completed
                    && result.processed > 0
                    && result.remaining > 0
                {
                    // Batch limit reached; keep draining
                    debounce_at = Some(Instant::now());
                }
            }
            Err(error) => tracing::error!(%error, "Sync pass failed"),
        }
    }
    tracing::debug!("Sync driver stopped");
}
