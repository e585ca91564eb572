//! Callback registry for connection and datapoint events.
//!
//! Registering a callback returns a [`Subscription`].  The callback stays
//! registered until [`Subscription::unsubscribe`] is called; dropping the
//! token alone leaves it in place.
//!
//! Callbacks run on the engine's event task.  The registry never holds its
//! lock while a callback runs, so a callback may register or unsubscribe
//! other callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tuya_ble_core::Datapoint;

use crate::application::device::lock;

pub type ConnectionCallback = Arc<dyn Fn() + Send + Sync>;
pub type DatapointsCallback = Arc<dyn Fn(&[Datapoint]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Connected,
    Datapoints,
    Disconnected,
}

#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    connected: Mutex<Vec<(u64, ConnectionCallback)>>,
    datapoints: Mutex<Vec<(u64, DatapointsCallback)>>,
    disconnected: Mutex<Vec<(u64, ConnectionCallback)>>,
}

/// Revocable handle for a registered callback.
#[must_use = "keep the subscription to be able to unsubscribe the callback later"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: ListenerKind,
    registry: Weak<Listeners>,
}

impl Subscription {
    /// Removes the callback.  Does nothing if the device is already gone.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match self.kind {
            ListenerKind::Connected => retain_others(&registry.connected, self.id),
            ListenerKind::Datapoints => retain_others(&registry.datapoints, self.id),
            ListenerKind::Disconnected => retain_others(&registry.disconnected, self.id),
        }
    }
}

fn retain_others<C>(list: &Mutex<Vec<(u64, C)>>, id: u64) {
    lock(list).retain(|(entry, _)| *entry != id);
}

fn snapshot<C: Clone>(list: &Mutex<Vec<(u64, C)>>) -> Vec<C> {
    lock(list).iter().map(|(_, cb)| cb.clone()).collect()
}

impl Listeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscription(self: &Arc<Self>, kind: ListenerKind) -> (u64, Subscription) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription {
            id,
            kind,
            registry: Arc::downgrade(self),
        };
        (id, sub)
    }

    pub fn on_connected(self: &Arc<Self>, callback: ConnectionCallback) -> Subscription {
        let (id, sub) = self.subscription(ListenerKind::Connected);
        lock(&self.connected).push((id, callback));
        sub
    }

    pub fn on_datapoints(self: &Arc<Self>, callback: DatapointsCallback) -> Subscription {
        let (id, sub) = self.subscription(ListenerKind::Datapoints);
        lock(&self.datapoints).push((id, callback));
        sub
    }

    pub fn on_disconnected(self: &Arc<Self>, callback: ConnectionCallback) -> Subscription {
        let (id, sub) = self.subscription(ListenerKind::Disconnected);
        lock(&self.disconnected).push((id, callback));
        sub
    }

    pub fn fire_connected(&self) {
        for cb in snapshot(&self.connected) {
            cb();
        }
    }

    pub fn fire_datapoints(&self, datapoints: &[Datapoint]) {
        for cb in snapshot(&self.datapoints) {
            cb(datapoints);
        }
    }

    pub fn fire_disconnected(&self) {
        for cb in snapshot(&self.disconnected) {
            cb();
        }
    }
}
