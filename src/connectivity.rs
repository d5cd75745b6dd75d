use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::model::UnixTimeMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    /// Platform online/offline event. Advisory only.
    Native,
    Probe,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub reachable: bool,
    pub source: SignalSource,
    pub at: UnixTimeMs,
}

/// Cheap check that the backend answers at all.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Tracks whether the backend is believed reachable and announces flips.
///
/// Never talks to the remote executor itself; subscribers decide what a
/// transition means.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    transitions: broadcast::Sender<Transition>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool, channel_capacity: usize) -> Self {
        let (state, _) = watch::channel(initially_reachable);
        let (transitions, _) = broadcast::channel(channel_capacity.max(1));
        Self { state, transitions }
    }

    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Feeds one observation in. Returns the transition if the state flipped.
    pub fn report(&self, source: SignalSource, reachable: bool) -> Option<Transition> {
        let flipped = self.state.send_if_modified(|current| {
            if *current == reachable {
                return false;
            }
            *current = reachable;
            true
        });

        if !flipped {
            debug!(?source, reachable, "Connectivity unchanged");
            return None;
        }

        let transition = Transition {
            reachable,
            source,
            at: UnixTimeMs::now(),
        };
        info!(?source, reachable, "Connectivity changed");
        // No subscribers is fine; the watch channel still holds the state.
        let _ = self.transitions.send(transition);
        Some(transition)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Polls `probe` every `interval` and reports each result as a probe signal.
    ///
    /// The first check runs immediately. The loop ends on its own once the
    /// monitor is dropped; abort the handle to stop it sooner.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = probe.check().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.report(SignalSource::Probe, reachable);
            }
        })
    }
}
