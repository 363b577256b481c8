use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use homescript_events::{EventKind, HostEvent, HostPlatform, Listener, ListenerId, ManagerKind};
use tracing::{debug, warn};

use super::{next_subscription_id, DispatchGate, Manager, SubscriptionHandle, SubscriptionId};
use crate::engine::RuleEngine;
use crate::error::{HostError, StopTimeout};
use crate::generation::Generation;
use crate::schema::EventSchema;

struct Subscription {
    kind: EventKind,
    listener: ListenerId,
}

/// Manager for events the host pushes: state changes and bus events
///
/// Each subscription registers one listener with the host. The listener runs
/// on the host's delivery thread and dispatches through the rule engine only
/// while the gate admits it.
pub struct StreamManager {
    kind: ManagerKind,
    generation: Generation,
    host: Arc<dyn HostPlatform>,
    engine: RuleEngine,
    gate: Arc<DispatchGate>,
    drain_timeout: Duration,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl StreamManager {
    pub fn new(
        kind: ManagerKind,
        generation: Generation,
        host: Arc<dyn HostPlatform>,
        engine: RuleEngine,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            generation,
            host,
            engine,
            gate: Arc::new(DispatchGate::new()),
            drain_timeout,
            next_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Manager for StreamManager {
    fn kind(&self) -> ManagerKind {
        self.kind
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn subscribe(
        &self,
        kind: EventKind,
        schema: Arc<EventSchema>,
    ) -> Result<SubscriptionHandle, HostError> {
        if kind.manager_kind() != self.kind {
            return Err(HostError::WrongManager {
                manager: self.kind.to_string(),
                kind: kind.to_string(),
            });
        }

        let mut subscriptions = self.subscriptions();
        if self.gate.is_closed() {
            return Err(HostError::StaleGeneration(self.generation));
        }

        let gate = self.gate.clone();
        let engine = self.engine.clone();
        let generation = self.generation;
        let listened = kind.clone();
        let listener: Listener = Arc::new(move |event: &HostEvent| {
            let Some(_in_flight) = gate.enter() else {
                return;
            };
            engine.dispatch(generation, &schema, &listened, &event.payload);
        });

        let id = next_subscription_id(&self.next_id);
        let listener = self.host.listen(&kind, listener);
        debug!(target: "scripting", "Subscribed to '{}' for {}", kind, generation);

        subscriptions.insert(
            id,
            Subscription {
                kind: kind.clone(),
                listener,
            },
        );
        drop(subscriptions);

        Ok(SubscriptionHandle {
            id,
            manager: self.kind,
            kind,
            generation,
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.subscriptions().remove(&handle.id);
        match removed {
            Some(subscription) => self.host.unlisten(subscription.listener),
            None => false,
        }
    }

    fn resume(&self) {
        self.gate.open();
    }

    fn stop_all(&self) -> Vec<StopTimeout> {
        let mut timeouts = Vec::new();
        let still_running = self.gate.close_and_drain(self.drain_timeout);
        if still_running > 0 {
            let timeout = StopTimeout {
                task: format!("{} dispatch ({} in flight)", self.kind, still_running),
                generation: self.generation,
                grace: self.drain_timeout,
            };
            warn!(target: "scripting", "{}", timeout);
            timeouts.push(timeout);
        }

        let drained: Vec<Subscription> = self.subscriptions().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            if !self.host.unlisten(subscription.listener) {
                debug!(
                    target: "scripting",
                    "Host had already dropped listener for '{}'",
                    subscription.kind
                );
            }
        }
        timeouts
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }
}
