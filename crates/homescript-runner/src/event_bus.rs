//! In-process host platform
//!
//! The bus owns the listener table the script host registers with and
//! delivers each published event to the matching listeners on the
//! publisher's thread. Observers that only want to watch traffic can take a
//! broadcast receiver instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use homescript_events::{EventKind, HostEvent, HostPlatform, Listener, ListenerId};
use tokio::sync::broadcast;
use tracing::trace;

struct Inner {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, (EventKind, Listener)>>,
    tap: broadcast::Sender<HostEvent>,
}

/// Central event bus that routes host events to script listeners
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// `capacity` bounds the broadcast tap; slow observers lag, listeners never do
    pub fn new(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                listeners: RwLock::new(HashMap::new()),
                tap,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ListenerId, (EventKind, Listener)>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ListenerId, (EventKind, Listener)>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every listener of its kind. Returns how many ran.
    pub fn publish(&self, event: HostEvent) -> usize {
        // Listeners run without the table lock so they may (un)register
        let listeners: Vec<Listener> = self
            .read()
            .values()
            .filter(|(kind, _)| *kind == event.kind)
            .map(|(_, listener)| listener.clone())
            .collect();

        trace!(target: "events", "Publishing '{}' to {} listener(s)", event.kind, listeners.len());
        for listener in &listeners {
            listener(&event);
        }

        let _ = self.inner.tap.send(event);
        listeners.len()
    }

    /// Watch every published event
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.tap.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tap.receiver_count()
    }

    pub fn listener_count(&self) -> usize {
        self.read().len()
    }

    /// Event kinds with at least one listener, sorted
    pub fn listened_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self.read().values().map(|(k, _)| k.clone()).collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds.dedup();
        kinds
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HostPlatform for EventBus {
    fn listen(&self, kind: &EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().insert(id, (kind.clone(), listener));
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.write().remove(&id).is_some()
    }
}
