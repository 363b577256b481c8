use std::sync::Arc;

use homescript_events::{EventKind, EventPayload};
use tracing::{debug, trace, warn};

use crate::action::{Action, ActionList, Effect, TaskFuture};
use crate::generation::{Generation, GenerationCounter};
use crate::schema::{ConditionSchema, EventSchema, TriggerMode};
use crate::supervisor::TaskSupervisor;

/// What happened during one dispatch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The dispatch carried a stale generation and nothing ran
    pub stale: bool,
    /// Condition items whose condition held (1 for an unconditional schema)
    pub matched: usize,
    /// Synchronous actions that completed
    pub executed: usize,
    /// Conditions or actions that failed and were skipped
    pub failed: usize,
    /// Actions handed to the task supervisor
    pub deferred: usize,
    /// Pending actions of the owning script dropped by this dispatch
    pub cancelled: usize,
}

/// Evaluates rule schemas against events
///
/// Everything runs synchronously on the caller's thread. Deferred and
/// asynchronous actions are handed to the [`TaskSupervisor`], tagged with the
/// script that owns the schema.
#[derive(Clone)]
pub struct RuleEngine {
    supervisor: Arc<TaskSupervisor>,
    generations: GenerationCounter,
}

impl RuleEngine {
    pub fn new(supervisor: Arc<TaskSupervisor>, generations: GenerationCounter) -> Self {
        Self {
            supervisor,
            generations,
        }
    }

    /// Run the schema registered for `kind`, if any.
    ///
    /// When something matches and the entry restarts its script, the owner's
    /// pending deferred work is cancelled before any matched action runs.
    pub fn dispatch(
        &self,
        generation: Generation,
        schema: &EventSchema,
        kind: &EventKind,
        payload: &EventPayload,
    ) -> DispatchOutcome {
        match schema.entry(kind) {
            Some((condition_schema, mode)) => self.run(
                generation,
                condition_schema,
                payload,
                schema.owner(),
                mode == TriggerMode::Restart,
            ),
            None => {
                trace!(target: "rules", "No rule for '{}'", kind);
                DispatchOutcome::default()
            }
        }
    }

    /// Evaluate a condition schema and execute what matches, without an
    /// owning script.
    ///
    /// A failing condition counts as false; a failing action is skipped.
    /// Neither stops the rest of the schema.
    pub fn evaluate(
        &self,
        generation: Generation,
        schema: &ConditionSchema,
        payload: &EventPayload,
    ) -> DispatchOutcome {
        self.run(generation, schema, payload, None, false)
    }

    fn run(
        &self,
        generation: Generation,
        schema: &ConditionSchema,
        payload: &EventPayload,
        owner: Option<&Arc<str>>,
        restart: bool,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if !self.generations.is_current(generation) {
            debug!(target: "rules", "Dropping dispatch from stale {}", generation);
            outcome.stale = true;
            return outcome;
        }

        let mut matched: Vec<&ActionList> = Vec::new();
        match schema {
            ConditionSchema::Unconditional(actions) => matched.push(actions),
            ConditionSchema::Conditional { items, exclusive } => {
                for item in items {
                    match item.condition.evaluate(payload) {
                        Ok(true) => {
                            matched.push(&item.actions);
                            if *exclusive {
                                break;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(target: "rules", "{}; treating as false", e);
                            outcome.failed += 1;
                        }
                    }
                }
            }
        }
        outcome.matched = matched.len();

        if restart && !matched.is_empty() {
            if let Some(owner) = owner {
                outcome.cancelled = self.supervisor.cancel_owner(owner);
            }
        }

        for actions in matched {
            self.execute(generation, owner, actions, payload, &mut outcome);
        }
        outcome
    }

    fn execute(
        &self,
        generation: Generation,
        owner: Option<&Arc<str>>,
        actions: &ActionList,
        payload: &EventPayload,
        outcome: &mut DispatchOutcome,
    ) {
        for action in actions {
            match &action.effect {
                Effect::Group(inner) => self.execute(generation, owner, inner, payload, outcome),
                Effect::After { .. } | Effect::Task(_) => {
                    if self.defer(generation, owner, action, payload) {
                        outcome.deferred += 1;
                    }
                }
                Effect::Nullary(_) | Effect::Unary(_) => match action.invoke(payload) {
                    Ok(()) => outcome.executed += 1,
                    Err(e) => {
                        warn!(target: "rules", "{}", e);
                        outcome.failed += 1;
                    }
                },
            }
        }
    }

    fn defer(
        &self,
        generation: Generation,
        owner: Option<&Arc<str>>,
        action: &Action,
        payload: &EventPayload,
    ) -> bool {
        let work: TaskFuture = match &action.effect {
            Effect::After { delay, actions } => {
                let engine = self.clone();
                let delay = *delay;
                let actions = actions.clone();
                let payload = payload.clone();
                let owner = owner.cloned();
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    let mut outcome = DispatchOutcome::default();
                    if engine.generations.is_current(generation) {
                        engine.execute(generation, owner.as_ref(), &actions, &payload, &mut outcome);
                    }
                    anyhow::Ok(())
                })
            }
            Effect::Task(f) => f(payload.clone()),
            _ => return false,
        };

        let handle = match owner {
            Some(owner) => self
                .supervisor
                .spawn_owned(action.name(), generation, owner.clone(), work),
            None => self.supervisor.spawn(action.name(), generation, work),
        };
        handle.is_some()
    }
}
