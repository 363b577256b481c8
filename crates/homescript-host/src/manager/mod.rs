//! Managers bind host event streams to rule schemas for one generation
//!
//! The [`ManagerRegistry`] holds at most one manager per [`ManagerKind`] for
//! the current generation, creating each lazily the first time a script
//! subscribes to an event it serves. Stopping a manager closes its dispatch
//! gate, waits for in-flight dispatches, and only then unsubscribes from the
//! host, so no rule of a retired generation can run once `stop_all` returns.

mod gate;
mod stream;
mod timer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use homescript_events::{EventKind, HostPlatform, ManagerKind};
use tracing::{debug, info};

use crate::engine::RuleEngine;
use crate::error::{HostError, StopTimeout};
use crate::generation::{Generation, GenerationCounter};
use crate::schema::EventSchema;
use crate::supervisor::TaskSupervisor;

pub(crate) use gate::DispatchGate;
pub use stream::StreamManager;
pub use timer::TimeManager;

/// Unique identifier for a subscription within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

pub(crate) fn next_subscription_id(counter: &AtomicU64) -> SubscriptionId {
    SubscriptionId(counter.fetch_add(1, Ordering::Relaxed))
}

/// Reference to a live subscription, returned to the subscribing script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub manager: ManagerKind,
    pub kind: EventKind,
    pub generation: Generation,
}

/// One class of host events bound to rule schemas
pub trait Manager: Send + Sync {
    fn kind(&self) -> ManagerKind;

    fn generation(&self) -> Generation;

    /// Deliver events of `kind` to the matching entry of `schema`
    fn subscribe(
        &self,
        kind: EventKind,
        schema: Arc<EventSchema>,
    ) -> Result<SubscriptionHandle, HostError>;

    /// Drop one subscription. Returns false if it was unknown.
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool;

    /// Start delivering events. Called once loading has finished.
    fn resume(&self);

    /// Refuse new deliveries, wait for in-flight ones, then release every
    /// host-side registration. Idempotent.
    fn stop_all(&self) -> Vec<StopTimeout>;

    fn subscription_count(&self) -> usize;
}

/// Subscriptions one script registered in one call
#[derive(Debug, Clone)]
pub struct Registration {
    pub script_id: String,
    pub handles: Vec<SubscriptionHandle>,
}

struct ManagerTable {
    generation: Generation,
    managers: BTreeMap<ManagerKind, Arc<dyn Manager>>,
    registrations: Vec<Registration>,
    resumed: bool,
}

impl ManagerTable {
    fn empty(generation: Generation) -> Self {
        Self {
            generation,
            managers: BTreeMap::new(),
            registrations: Vec::new(),
            resumed: false,
        }
    }
}

/// Live managers of the current generation
pub struct ManagerRegistry {
    host: Arc<dyn HostPlatform>,
    engine: RuleEngine,
    supervisor: Arc<TaskSupervisor>,
    generations: GenerationCounter,
    drain_timeout: Duration,
    table: RwLock<ManagerTable>,
}

impl ManagerRegistry {
    pub fn new(
        host: Arc<dyn HostPlatform>,
        supervisor: Arc<TaskSupervisor>,
        generations: GenerationCounter,
        drain_timeout: Duration,
    ) -> Self {
        let engine = RuleEngine::new(supervisor.clone(), generations.clone());
        let table = ManagerTable::empty(generations.current());
        Self {
            host,
            engine,
            supervisor,
            generations,
            drain_timeout,
            table: RwLock::new(table),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ManagerTable> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManagerTable> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// The manager of `kind` for `generation`, created on first use
    pub fn manager(
        &self,
        kind: ManagerKind,
        generation: Generation,
    ) -> Result<Arc<dyn Manager>, HostError> {
        if !self.generations.is_current(generation) {
            return Err(HostError::StaleGeneration(generation));
        }

        if let Some(manager) = self.read().managers.get(&kind) {
            if manager.generation() == generation {
                return Ok(manager.clone());
            }
        }

        let mut table = self.write();
        if table.generation != generation {
            if !table.managers.is_empty() {
                return Err(HostError::Bookkeeping(format!(
                    "managers of {} were not cleared before {}",
                    table.generation, generation
                )));
            }
            *table = ManagerTable::empty(generation);
        }

        let resumed = table.resumed;
        let manager = table
            .managers
            .entry(kind)
            .or_insert_with(|| {
                debug!(target: "scripting", "Creating {} manager for {}", kind, generation);
                self.create(kind, generation)
            })
            .clone();
        if resumed {
            manager.resume();
        }
        Ok(manager)
    }

    fn create(&self, kind: ManagerKind, generation: Generation) -> Arc<dyn Manager> {
        match kind {
            ManagerKind::State | ManagerKind::Bus => Arc::new(StreamManager::new(
                kind,
                generation,
                self.host.clone(),
                self.engine.clone(),
                self.drain_timeout,
            )),
            ManagerKind::Time => Arc::new(TimeManager::new(
                generation,
                self.engine.clone(),
                self.supervisor.clone(),
                self.drain_timeout,
            )),
        }
    }

    /// Subscribe every entry of `schema` with the manager that serves it
    pub fn register(
        &self,
        script_id: &str,
        generation: Generation,
        schema: EventSchema,
    ) -> Result<Vec<SubscriptionHandle>, HostError> {
        let schema = Arc::new(schema.with_owner(script_id));
        let mut handles = Vec::with_capacity(schema.len());

        for kind in schema.kinds() {
            let subscribed = self
                .manager(kind.manager_kind(), generation)
                .and_then(|manager| manager.subscribe(kind.clone(), schema.clone()));
            match subscribed {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        manager_unsubscribe(self, handle);
                    }
                    return Err(e);
                }
            }
        }

        let mut table = self.write();
        if table.generation == generation {
            table.registrations.push(Registration {
                script_id: script_id.to_string(),
                handles: handles.clone(),
            });
        }
        Ok(handles)
    }

    /// Drop `handles` from their managers and from the registration record
    /// of `script_id`. Returns how many were live.
    pub fn unregister(&self, script_id: &str, handles: &[SubscriptionHandle]) -> usize {
        let removed = handles
            .iter()
            .filter(|handle| manager_unsubscribe(self, handle))
            .count();

        let mut table = self.write();
        for registration in table
            .registrations
            .iter_mut()
            .filter(|r| r.script_id == script_id)
        {
            registration.handles.retain(|h| !handles.contains(h));
        }
        table.registrations.retain(|r| !r.handles.is_empty());
        removed
    }

    /// Start delivery on every manager of `generation`, and on any created
    /// for it later
    pub fn resume(&self, generation: Generation) {
        let managers: Vec<Arc<dyn Manager>> = {
            let mut table = self.write();
            if table.generation != generation {
                debug!(
                    target: "scripting",
                    "Not resuming {}: live managers belong to {}",
                    generation,
                    table.generation
                );
                return;
            }
            table.resumed = true;
            table.managers.values().cloned().collect()
        };
        for manager in managers {
            manager.resume();
        }
    }

    /// Stop every live manager. Blocks until each has drained and released
    /// its host registrations. Safe to call repeatedly.
    pub fn stop_all(&self) -> Vec<StopTimeout> {
        let (generation, managers): (Generation, Vec<Arc<dyn Manager>>) = {
            let table = self.read();
            (table.generation, table.managers.values().cloned().collect())
        };

        let mut timeouts = Vec::new();
        for manager in &managers {
            timeouts.extend(manager.stop_all());
        }
        if !managers.is_empty() {
            info!(
                target: "scripting",
                "Stopped {} manager(s) of {}",
                managers.len(),
                generation
            );
        }
        timeouts
    }

    /// Drop every manager and registration record. Only valid after
    /// [`Self::stop_all`].
    pub fn clear(&self) {
        let mut table = self.write();
        let generation = self.generations.current();
        *table = ManagerTable::empty(generation);
    }

    /// Total subscriptions across live managers
    pub fn subscription_count(&self) -> usize {
        self.read()
            .managers
            .values()
            .map(|m| m.subscription_count())
            .sum()
    }

    /// Generation the live managers belong to
    pub fn generation(&self) -> Generation {
        self.read().generation
    }

    /// Generations of every live manager, with its subscription count
    pub fn snapshot(&self) -> Vec<(ManagerKind, Generation, usize)> {
        self.read()
            .managers
            .values()
            .map(|m| (m.kind(), m.generation(), m.subscription_count()))
            .collect()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.read().registrations.clone()
    }
}

fn manager_unsubscribe(registry: &ManagerRegistry, handle: &SubscriptionHandle) -> bool {
    let manager = registry
        .read()
        .managers
        .get(&handle.manager)
        .filter(|m| m.generation() == handle.generation)
        .cloned();
    manager.is_some_and(|m| m.unsubscribe(handle))
}
