use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use homescript_events::{EventKind, EventPayload, ManagerKind};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{next_subscription_id, DispatchGate, Manager, SubscriptionHandle, SubscriptionId};
use crate::engine::RuleEngine;
use crate::error::{HostError, StopTimeout};
use crate::generation::Generation;
use crate::schema::EventSchema;
use crate::supervisor::{TaskHandle, TaskSupervisor};

/// A recurring timer bound to a schema
struct Timer {
    kind: EventKind,
    period: Duration,
    schema: Arc<EventSchema>,
    /// Set once the timer is running
    task: Option<TaskHandle>,
}

/// Manager for `every:<duration>` events
///
/// Each subscription is a supervised task ticking at its period. Timers
/// registered while loading start when the manager is resumed.
pub struct TimeManager {
    generation: Generation,
    engine: RuleEngine,
    supervisor: Arc<TaskSupervisor>,
    gate: Arc<DispatchGate>,
    drain_timeout: Duration,
    next_id: AtomicU64,
    timers: Mutex<HashMap<SubscriptionId, Timer>>,
}

impl TimeManager {
    pub fn new(
        generation: Generation,
        engine: RuleEngine,
        supervisor: Arc<TaskSupervisor>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            generation,
            engine,
            supervisor,
            gate: Arc::new(DispatchGate::new()),
            drain_timeout,
            next_id: AtomicU64::new(0),
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Timer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(&self, timer: &mut Timer) {
        if timer.task.is_some() {
            return;
        }

        let gate = self.gate.clone();
        let engine = self.engine.clone();
        let generation = self.generation;
        let schema = timer.schema.clone();
        let kind = timer.kind.clone();
        let period = timer.period;

        timer.task = self.supervisor.spawn(kind.to_string(), generation, async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sequence = 0u64;
            loop {
                ticker.tick().await;
                sequence += 1;
                let Some(_in_flight) = gate.enter() else {
                    break;
                };
                engine.dispatch(generation, &schema, &kind, &EventPayload::Tick { sequence });
            }
            anyhow::Ok(())
        });

        if timer.task.is_none() {
            debug!(target: "scripting", "Timer '{}' not started: {} is stale", timer.kind, generation);
        }
    }
}

impl Manager for TimeManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Time
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn subscribe(
        &self,
        kind: EventKind,
        schema: Arc<EventSchema>,
    ) -> Result<SubscriptionHandle, HostError> {
        let EventKind::Interval(period) = kind else {
            return Err(HostError::WrongManager {
                manager: ManagerKind::Time.to_string(),
                kind: kind.to_string(),
            });
        };

        let mut timers = self.timers();
        if self.gate.is_closed() {
            return Err(HostError::StaleGeneration(self.generation));
        }

        let id = next_subscription_id(&self.next_id);
        let mut timer = Timer {
            kind: kind.clone(),
            period,
            schema,
            task: None,
        };
        if self.gate.is_open() {
            self.start(&mut timer);
        }
        timers.insert(id, timer);

        Ok(SubscriptionHandle {
            id,
            manager: ManagerKind::Time,
            kind,
            generation: self.generation,
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.timers().remove(&handle.id);
        match removed {
            Some(timer) => {
                if let Some(task) = timer.task {
                    self.supervisor.cancel(&task);
                }
                true
            }
            None => false,
        }
    }

    fn resume(&self) {
        let mut timers = self.timers();
        if !self.gate.open() {
            return;
        }
        for timer in timers.values_mut() {
            self.start(timer);
        }
    }

    fn stop_all(&self) -> Vec<StopTimeout> {
        let mut timeouts = Vec::new();
        let still_running = self.gate.close_and_drain(self.drain_timeout);
        if still_running > 0 {
            let timeout = StopTimeout {
                task: format!("timer dispatch ({} in flight)", still_running),
                generation: self.generation,
                grace: self.drain_timeout,
            };
            warn!(target: "scripting", "{}", timeout);
            timeouts.push(timeout);
        }

        let stopped: Vec<Timer> = self.timers().drain().map(|(_, t)| t).collect();
        for timer in stopped {
            if let Some(task) = timer.task {
                self.supervisor.cancel(&task);
            }
        }
        timeouts
    }

    fn subscription_count(&self) -> usize {
        self.timers().len()
    }
}
