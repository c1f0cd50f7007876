// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event fan-out to observers and the delegate.
//!
//! Notifications are drained by a single spawned dispatcher task so that
//! observer callbacks never block command execution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::pump::events::{PumpAlert, PumpEvent};
use crate::pump::state::{PumpState, PumpStatus};

/// Callback receiving the full internal state.
pub type StateCallback = Box<dyn Fn(&PumpState) + Send + Sync>;
/// Callback receiving `(old, new)` status snapshots.
pub type StatusCallback = Box<dyn Fn(&PumpStatus, &PumpStatus) + Send + Sync>;

/// Returned by registration; used for explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(Uuid);

/// Consumer of pump lifecycle callbacks, typically the surrounding
/// dosing/scheduling system.
pub trait PumpDelegate: Send + Sync {
    fn on_new_pump_events(&self, _events: &[PumpEvent], _reconciliation_time: DateTime<Utc>) {}
    fn on_reservoir_reading(&self, _units: f64, _time: DateTime<Utc>) {}
    fn on_state_updated(&self) {}
    fn on_status_updated(&self, _old: &PumpStatus, _new: &PumpStatus) {}
    fn on_clock_adjusted(&self, _offset: chrono::Duration) {}
    fn on_heartbeat(&self) {}
    fn on_alert(&self, _alert: PumpAlert) {}
}

enum Notification {
    StateChanged {
        state: Box<PumpState>,
        old: PumpStatus,
        new: PumpStatus,
    },
    Events {
        events: Vec<PumpEvent>,
        reconciled_at: DateTime<Utc>,
    },
    Reservoir {
        units: f64,
        time: DateTime<Utc>,
    },
    ClockAdjusted(chrono::Duration),
    Heartbeat,
    Alert(PumpAlert),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Registry {
    state_observers: RwLock<HashMap<ObserverToken, StateCallback>>,
    status_observers: RwLock<HashMap<ObserverToken, StatusCallback>>,
    delegate: RwLock<Option<Arc<dyn PumpDelegate>>>,
}

/// Fans out state changes, status changes and device events.
pub struct EventPublisher {
    registry: Arc<Registry>,
    tx: mpsc::UnboundedSender<Notification>,
}

impl EventPublisher {
    /// Create the publisher and spawn its dispatcher task.
    pub fn new() -> Self {
        let registry = Arc::new(Registry::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(registry.clone(), rx));
        Self { registry, tx }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn PumpDelegate>) {
        *self.registry.delegate.write() = Some(delegate);
    }

    pub fn register_state_observer(&self, callback: StateCallback) -> ObserverToken {
        let token = ObserverToken(Uuid::new_v4());
        self.registry.state_observers.write().insert(token, callback);
        token
    }

    pub fn register_status_observer(&self, callback: StatusCallback) -> ObserverToken {
        let token = ObserverToken(Uuid::new_v4());
        self.registry
            .status_observers
            .write()
            .insert(token, callback);
        token
    }

    /// Remove a previously registered observer; unknown tokens are ignored.
    pub fn remove_observer(&self, token: ObserverToken) {
        self.registry.state_observers.write().remove(&token);
        self.registry.status_observers.write().remove(&token);
    }

    pub fn publish_state_change(&self, state: PumpState, old: PumpStatus, new: PumpStatus) {
        self.send(Notification::StateChanged {
            state: Box::new(state),
            old,
            new,
        });
    }

    /// Deliver new pump events to the delegate only.
    pub fn publish_events(&self, events: Vec<PumpEvent>, reconciled_at: DateTime<Utc>) {
        if events.is_empty() {
            return;
        }
        self.send(Notification::Events {
            events,
            reconciled_at,
        });
    }

    pub fn publish_reservoir(&self, units: f64, time: DateTime<Utc>) {
        self.send(Notification::Reservoir { units, time });
    }

    pub fn publish_clock_adjusted(&self, offset: chrono::Duration) {
        self.send(Notification::ClockAdjusted(offset));
    }

    pub fn publish_heartbeat(&self) {
        self.send(Notification::Heartbeat);
    }

    pub fn publish_alert(&self, alert: PumpAlert) {
        self.send(Notification::Alert(alert));
    }

    /// Wait until every notification published so far has been dispatched.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Notification::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("notification dropped: dispatcher task is gone");
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(registry: Arc<Registry>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let delegate = registry.delegate.read().clone();
        match notification {
            Notification::StateChanged { state, old, new } => {
                for callback in registry.state_observers.read().values() {
                    callback(&state);
                }
                if let Some(delegate) = &delegate {
                    delegate.on_state_updated();
                    delegate.on_status_updated(&old, &new);
                }
                for callback in registry.status_observers.read().values() {
                    callback(&old, &new);
                }
            }
            Notification::Events {
                events,
                reconciled_at,
            } => {
                if let Some(delegate) = &delegate {
                    delegate.on_new_pump_events(&events, reconciled_at);
                }
            }
            Notification::Reservoir { units, time } => {
                if let Some(delegate) = &delegate {
                    delegate.on_reservoir_reading(units, time);
                }
            }
            Notification::ClockAdjusted(offset) => {
                if let Some(delegate) = &delegate {
                    delegate.on_clock_adjusted(offset);
                }
            }
            Notification::Heartbeat => {
                if let Some(delegate) = &delegate {
                    delegate.on_heartbeat();
                }
            }
            Notification::Alert(alert) => {
                if let Some(delegate) = &delegate {
                    delegate.on_alert(alert);
                }
            }
            Notification::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::state::PumpState;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample() -> (PumpState, PumpStatus, PumpStatus) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut state = PumpState::new(now);
        let old = state.status_snapshot(now);
        let new = state.status_snapshot(now + chrono::Duration::seconds(1));
        (state, old, new)
    }

    #[tokio::test]
    async fn test_status_observers_receive_both_snapshots() {
        let publisher = EventPublisher::new();
        let calls = Arc::new(AtomicU32::new(0));

        let observed = calls.clone();
        publisher.register_status_observer(Box::new(move |old, new| {
            assert!(old.timestamp < new.timestamp);
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let (state, old, new) = sample();
        publisher.publish_state_change(state, old, new);
        publisher.flush().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_observer_stops_receiving() {
        let publisher = EventPublisher::new();
        let calls = Arc::new(AtomicU32::new(0));

        let observed = calls.clone();
        let token = publisher.register_state_observer(Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let (state, old, new) = sample();
        publisher.publish_state_change(state.clone(), old.clone(), new.clone());
        publisher.flush().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        publisher.remove_observer(token);
        publisher.publish_state_change(state, old, new);
        publisher.flush().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_event_batches_are_not_delivered() {
        struct CountingDelegate(AtomicU32);
        impl PumpDelegate for CountingDelegate {
            fn on_new_pump_events(&self, _: &[PumpEvent], _: DateTime<Utc>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let publisher = EventPublisher::new();
        let delegate = Arc::new(CountingDelegate(AtomicU32::new(0)));
        publisher.set_delegate(delegate.clone());

        publisher.publish_events(Vec::new(), Utc::now());
        publisher.flush().await;

        assert_eq!(delegate.0.load(Ordering::SeqCst), 0);
    }
}
