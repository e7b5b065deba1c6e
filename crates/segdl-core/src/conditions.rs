//! Network and power conditions as reported by the platform
//!
//! The platform pushes snapshots into [`Conditions`]; the engine and the
//! in-process scheduler observe them through `tokio::sync::watch`.

use tokio::sync::watch;

/// Connectivity snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub metered: bool,
    pub roaming: bool,
    /// Opaque identity of the active network (e.g. an SSID or interface name)
    pub identity: Option<String>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            connected: true,
            metered: false,
            roaming: false,
            identity: None,
        }
    }
}

/// Power snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerState {
    pub charging: bool,
    pub battery_low: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemState {
    pub network: NetworkState,
    pub power: PowerState,
}

/// Shared, observable system conditions
#[derive(Debug, Clone)]
pub struct Conditions {
    tx: watch::Sender<SystemState>,
}

impl Conditions {
    pub fn new(initial: SystemState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new snapshot; observers are only woken on an actual change
    pub fn set(&self, state: SystemState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn update(&self, f: impl FnOnce(&mut SystemState)) {
        let mut state = self.current();
        f(&mut state);
        self.set(state);
    }

    pub fn current(&self) -> SystemState {
        self.tx.borrow().clone()
    }

    pub fn network(&self) -> NetworkState {
        self.tx.borrow().network.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.tx.subscribe()
    }
}

impl Default for Conditions {
    fn default() -> Self {
        Self::new(SystemState::default())
    }
}
