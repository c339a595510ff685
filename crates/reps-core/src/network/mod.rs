//! Connectivity tracking
//!
//! [`NetworkMonitor`] owns the current [`NetworkState`]. Platform adapters push
//! observations through [`NetworkMonitor::update`] or hand a
//! [`ConnectivityProbe`] to [`NetworkMonitor::refresh`]; components that need
//! to react either subscribe a listener or hold a `watch` receiver.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::models::{NetworkQuality, NetworkState};
use crate::notify::{Listeners, Subscription};
use crate::util::now_ms;

/// The platform could not report connectivity
#[derive(Debug, Error)]
#[error("connectivity probe failed: {0}")]
pub struct ProbeError(pub String);

/// Source of connectivity observations
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<NetworkState, ProbeError>;
}

/// Current connectivity plus change notification
#[derive(Debug)]
pub struct NetworkMonitor {
    state: watch::Sender<NetworkState>,
    listeners: Listeners<NetworkState>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    /// Start from the conservative assumed-online state
    pub fn new() -> Self {
        Self::with_state(NetworkState::assumed_online())
    }

    pub fn with_state(state: NetworkState) -> Self {
        let (sender, _) = watch::channel(state.normalized());
        Self {
            state: sender,
            listeners: Listeners::new("network monitor"),
        }
    }

    pub fn current_state(&self) -> NetworkState {
        self.state.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn quality(&self) -> NetworkQuality {
        self.state.borrow().quality()
    }

    /// Apply an observation; returns whether connectivity changed
    ///
    /// Transition timestamps are stamped here; the ones on `observed` are
    /// ignored. Observations equal to the current state are not re-emitted.
    pub fn update(&self, observed: NetworkState) -> bool {
        let observed = observed.normalized();
        let mut next = None;
        self.state.send_if_modified(|current| {
            if current.same_connectivity(&observed) {
                return false;
            }
            let now = now_ms();
            let mut state = observed.clone();
            state.last_online_time = current.last_online_time;
            state.last_offline_time = current.last_offline_time;
            if state.is_online && !current.is_online {
                state.last_online_time = Some(now);
            }
            if !state.is_online && current.is_online {
                state.last_offline_time = Some(now);
            }
            *current = state.clone();
            next = Some(state);
            true
        });

        let Some(state) = next else {
            return false;
        };
        tracing::info!(
            online = state.is_online,
            reachable = state.is_internet_reachable,
            connection = %state.connection_type,
            "Connectivity changed"
        );
        self.listeners.emit(&state);
        true
    }

    /// Ask a probe for the current state
    ///
    /// A failing probe is not an error: the monitor falls back to the
    /// assumed-online default so sync can still be attempted.
    pub async fn refresh(&self, probe: &dyn ConnectivityProbe) -> NetworkState {
        match probe.probe().await {
            Ok(state) => {
                self.update(state);
            }
            Err(error) => {
                tracing::warn!(%error, "Network probe unavailable; assuming online");
                self.update(NetworkState::assumed_online());
            }
        }
        self.current_state()
    }

    /// Invoke `listener` on every connectivity change
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(NetworkState) + Send + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Receiver that always holds the latest state
    pub fn watch(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }
}
