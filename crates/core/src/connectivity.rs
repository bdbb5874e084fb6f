//! Connectivity tracking with edge-triggered change notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Physical transport reported by the platform reachability signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Network state as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub is_online: bool,
    pub transport: TransportKind,
}

impl NetworkState {
    pub fn online(transport: TransportKind) -> Self {
        Self {
            is_online: true,
            transport,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            transport: TransportKind::Unknown,
        }
    }
}

impl Default for NetworkState {
    /// Fail open: without a platform signal the monitor assumes online and
    /// lets failed remote calls act as the fallback signal.
    fn default() -> Self {
        Self {
            is_online: true,
            transport: TransportKind::Unknown,
        }
    }
}

/// Platform hook sampling the current reachability state.
///
/// `None` means the platform cannot tell; the monitor keeps its last state.
pub trait ReachabilityProbe: Send + Sync {
    fn probe(&self) -> Option<NetworkState>;
}

type ChangeListener = Arc<dyn Fn(NetworkState) + Send + Sync>;

/// Tracks network state and notifies subscribers on online/offline edges.
///
/// Transport-only changes update the stored state without firing callbacks;
/// subscribers hear from the monitor exactly once per online flip.
pub struct ConnectivityMonitor {
    state: RwLock<NetworkState>,
    probe: Option<Box<dyn ReachabilityProbe>>,
    listeners: Mutex<HashMap<u64, ChangeListener>>,
    next_listener_id: AtomicU64,
}

impl ConnectivityMonitor {
    /// Monitor without a platform probe; state changes arrive via
    /// [`set_reachability`](Self::set_reachability).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(NetworkState::default()),
            probe: None,
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Monitor seeded from a platform probe.
    pub fn with_probe(probe: Box<dyn ReachabilityProbe>) -> Self {
        let initial = probe.probe().unwrap_or_default();
        Self {
            state: RwLock::new(initial),
            probe: Some(probe),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// The last reported state. Poisoning falls back to the fail-open default.
    pub fn current_state(&self) -> NetworkState {
        self.state.read().map(|state| *state).unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.current_state().is_online
    }

    /// Register an edge-triggered listener. Dropping the returned handle
    /// unsubscribes.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(NetworkState) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, Arc::new(listener));
        }
        SubscriptionHandle {
            id,
            monitor: Arc::downgrade(self),
        }
    }

    /// Feed a state report from platform glue. Listeners fire only when the
    /// online flag actually flips.
    pub fn set_reachability(&self, new_state: NetworkState) {
        let edge = {
            let mut state = match self.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let flipped = state.is_online != new_state.is_online;
            *state = new_state;
            flipped
        };

        if !edge {
            return;
        }

        if new_state.is_online {
            info!("connectivity regained ({:?})", new_state.transport);
        } else {
            info!("connectivity lost");
        }

        for listener in self.snapshot_listeners() {
            listener(new_state);
        }
    }

    /// Poll the probe once and apply the result, if a probe is configured.
    pub fn refresh(&self) {
        let Some(probe) = self.probe.as_ref() else {
            return;
        };
        match probe.probe() {
            Some(state) => self.set_reachability(state),
            None => debug!("reachability probe returned no signal; keeping last state"),
        }
    }

    fn snapshot_listeners(&self) -> Vec<ChangeListener> {
        self.listeners
            .lock()
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_listener(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&id);
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connectivity subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle {
    id: u64,
    monitor: Weak<ConnectivityMonitor>,
}

impl SubscriptionHandle {
    /// Explicitly remove the subscription.
    pub fn cancel(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.remove_listener(self.id);
        }
    }
}

/// Poll the probe on a fixed cadence, for hosts without push reachability
/// callbacks. Abort the returned handle to stop.
pub fn spawn_probe_poller(
    monitor: Arc<ConnectivityMonitor>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            monitor.refresh();
        }
    })
}
