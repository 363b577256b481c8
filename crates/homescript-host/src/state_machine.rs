//! Rules derived from named states
//!
//! A [`State`] is a named condition with optional side effects. It learns
//! which state changes can make it true in one of three ways:
//!
//! - `activated_by`: the given triggers, as they are
//! - `affect_by`: the given triggers, guarded by the state's own condition
//! - `depend_on`: groups of other states. Every trigger of one member is
//!   guarded by the conditions of the rest of its group.
//!
//! [`StateMachine::build`] resolves every state to its triggers and turns the
//! states with side effects into a [`RawEventSchema`] keyed by entity.
//!
//! ```text
//! home     (is_home)   activated_by person.me -> home
//! dark     (is_night)  affect_by    sun.sun
//! evening              depend_on    [home, dark], side effect lights_on
//!
//! state:person.me  when new_states[home] & is_night  -> lights_on
//! state:sun.sun    when is_night & is_home           -> lights_on
//! ```

use std::collections::BTreeSet;

use tracing::debug;

use crate::action::ActionList;
use crate::condition::Condition;
use crate::error::SchemaError;
use crate::schema::{RawConditionSchema, RawEventSchema};

/// A state change of one entity, optionally filtered
#[derive(Debug, Clone)]
pub struct StateTrigger {
    entity_id: String,
    condition: Option<Condition>,
}

impl StateTrigger {
    /// Any state change of `entity_id`
    pub fn on(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            condition: None,
        }
    }

    /// Only changes coming from one of `states`
    pub fn from<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.when(Condition::old_state_in(states))
    }

    /// Only changes going to one of `states`
    pub fn to<I, S>(self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.when(Condition::new_state_in(states))
    }

    /// Conjoin `condition` with the trigger's filter
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing & condition,
            None => condition,
        });
        self
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    fn guarded(&self, condition: Option<&Condition>) -> Self {
        match condition {
            Some(condition) => self.clone().when(condition.clone()),
            None => self.clone(),
        }
    }
}

/// Index of a state inside its [`StateMachine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(usize);

/// A named condition and what to do when it becomes true
#[derive(Debug, Clone)]
pub struct State {
    name: String,
    condition: Condition,
    side_effects: ActionList,
    activated_by: Vec<StateTrigger>,
    affect_by: Vec<StateTrigger>,
    depend_on: Vec<Vec<StateId>>,
    /// Set on inverted copies; triggers and dependencies come from here
    mirror_of: Option<StateId>,
}

impl State {
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            condition,
            side_effects: ActionList::new(),
            activated_by: Vec::new(),
            affect_by: Vec::new(),
            depend_on: Vec::new(),
            mirror_of: None,
        }
    }

    pub fn side_effects(mut self, actions: impl Into<ActionList>) -> Self {
        let actions: ActionList = actions.into();
        for action in &actions {
            self.side_effects.push(action.clone());
        }
        self
    }

    pub fn activated_by(mut self, trigger: StateTrigger) -> Self {
        self.activated_by.push(trigger);
        self
    }

    pub fn affect_by(mut self, trigger: StateTrigger) -> Self {
        self.affect_by.push(trigger);
        self
    }

    /// Add a group of states this one follows. May be called more than once.
    pub fn depend_on(mut self, group: impl IntoIterator<Item = StateId>) -> Self {
        self.depend_on.push(group.into_iter().collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }
}

/// States of one script, resolved together
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    states: Vec<State>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, id: StateId) -> Option<&State> {
        self.states.get(id.0)
    }

    /// Id of the state called `name`, inverted copies included
    pub fn find(&self, name: &str) -> Option<StateId> {
        self.states.iter().position(|s| s.name == name).map(StateId)
    }

    pub fn add(&mut self, state: State) -> Result<StateId, SchemaError> {
        if !state.activated_by.is_empty() && !state.affect_by.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "state '{}' is both activated and affected by events",
                state.name
            )));
        }
        if self.find(&state.name).is_some() {
            return Err(SchemaError::Invalid(format!(
                "state '{}' is declared more than once",
                state.name
            )));
        }
        self.check_members(&state.name, &state.depend_on)?;
        self.states.push(state);
        Ok(StateId(self.states.len() - 1))
    }

    /// Add a dependency group to a state already in the machine
    pub fn add_dependency(
        &mut self,
        id: StateId,
        group: impl IntoIterator<Item = StateId>,
    ) -> Result<(), SchemaError> {
        let group: Vec<StateId> = group.into_iter().collect();
        let name = self.state(id)?.name.clone();
        self.check_members(&name, std::slice::from_ref(&group))?;
        let target = self.mirror(id);
        self.states[target.0].depend_on.push(group);
        Ok(())
    }

    /// The negation of `id`, named `NOT <name>`. Created once and reused.
    ///
    /// It is triggered like the original but guarded by the inverted
    /// condition. States with side effects cannot be inverted.
    pub fn invert(&mut self, id: StateId) -> Result<StateId, SchemaError> {
        let base = self.state(id)?;
        if !base.side_effects.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "state '{}' has side effects and cannot be inverted",
                base.name
            )));
        }
        let name = format!("NOT {}", base.name);
        if let Some(existing) = self.find(&name) {
            return Ok(existing);
        }

        let inverted = State {
            name,
            condition: !base.condition.clone(),
            side_effects: ActionList::new(),
            activated_by: Vec::new(),
            affect_by: Vec::new(),
            depend_on: Vec::new(),
            mirror_of: Some(self.mirror(id)),
        };
        self.states.push(inverted);
        Ok(StateId(self.states.len() - 1))
    }

    fn state(&self, id: StateId) -> Result<&State, SchemaError> {
        self.states.get(id.0).ok_or_else(|| SchemaError::UnknownName {
            what: "state",
            name: format!("#{}", id.0),
        })
    }

    /// The state whose triggers and dependencies `id` uses
    fn mirror(&self, id: StateId) -> StateId {
        self.states
            .get(id.0)
            .and_then(|s| s.mirror_of)
            .unwrap_or(id)
    }

    fn check_members(&self, name: &str, groups: &[Vec<StateId>]) -> Result<(), SchemaError> {
        for group in groups {
            if group.is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "state '{}' has an empty dependency group",
                    name
                )));
            }
            for member in group {
                self.state(*member)?;
            }
        }
        Ok(())
    }

    /// Triggers of every state, indexed by [`StateId`].
    ///
    /// Fails if some state has no triggers of its own and its dependencies
    /// never resolve, which includes dependency cycles.
    pub fn resolve(&self) -> Result<Vec<Vec<StateTrigger>>, SchemaError> {
        let mut resolved: Vec<Option<Vec<StateTrigger>>> = vec![None; self.states.len()];
        let mut remaining = self.states.len();

        while remaining > 0 {
            let mut progress = false;
            for index in 0..self.states.len() {
                if resolved[index].is_some() {
                    continue;
                }
                if let Some(triggers) = self.try_resolve(StateId(index), &resolved) {
                    debug!(
                        target: "rules",
                        "State '{}' resolved to {} trigger(s)",
                        self.states[index].name,
                        triggers.len()
                    );
                    resolved[index] = Some(triggers);
                    remaining -= 1;
                    progress = true;
                }
            }
            if !progress {
                let stuck: Vec<&str> = self
                    .states
                    .iter()
                    .zip(&resolved)
                    .filter(|(_, r)| r.is_none())
                    .map(|(s, _)| s.name.as_str())
                    .collect();
                return Err(SchemaError::Invalid(format!(
                    "states without a way to become active: {}",
                    stuck.join(", ")
                )));
            }
        }

        Ok(resolved.into_iter().flatten().collect())
    }

    fn try_resolve(
        &self,
        id: StateId,
        resolved: &[Option<Vec<StateTrigger>>],
    ) -> Option<Vec<StateTrigger>> {
        let state = &self.states[id.0];
        let source = &self.states[self.mirror(id).0];

        if !source.activated_by.is_empty() {
            return Some(source.activated_by.clone());
        }
        if !source.affect_by.is_empty() {
            return Some(
                source
                    .affect_by
                    .iter()
                    .map(|t| t.guarded(Some(&state.condition)))
                    .collect(),
            );
        }
        if source.depend_on.is_empty() {
            return None;
        }

        let mut triggers = Vec::new();
        for group in &source.depend_on {
            for (position, member) in group.iter().enumerate() {
                let member_triggers = resolved[member.0].as_ref()?;
                let others: Vec<Condition> = group
                    .iter()
                    .enumerate()
                    .filter(|(other, _)| *other != position)
                    .map(|(_, other)| self.states[other.0].condition.clone())
                    .collect();
                let guard = (!others.is_empty()).then(|| Condition::all(others));
                triggers.extend(member_triggers.iter().map(|t| t.guarded(guard.as_ref())));
            }
        }
        Some(triggers)
    }

    /// Rules for every state with side effects
    pub fn build(&self) -> Result<RawEventSchema, SchemaError> {
        self.build_filtered(|_| true)
    }

    /// Rules for the listed states only. States without side effects are
    /// skipped either way.
    pub fn build_only(&self, ids: &[StateId]) -> Result<RawEventSchema, SchemaError> {
        let wanted: BTreeSet<StateId> = ids.iter().copied().collect();
        self.build_filtered(|id| wanted.contains(&id))
    }

    fn build_filtered(&self, keep: impl Fn(StateId) -> bool) -> Result<RawEventSchema, SchemaError> {
        let resolved = self.resolve()?;

        // entity -> ordered (condition, actions); identical guards share a branch
        let mut entities: Vec<(String, Vec<(Condition, ActionList)>)> = Vec::new();
        for (index, triggers) in resolved.iter().enumerate() {
            let state = &self.states[index];
            if !keep(StateId(index)) || state.side_effects.is_empty() {
                continue;
            }
            for trigger in triggers {
                let condition = trigger.condition.clone().unwrap_or_else(Condition::always);
                let position = match entities.iter().position(|(e, _)| *e == trigger.entity_id) {
                    Some(position) => position,
                    None => {
                        entities.push((trigger.entity_id.clone(), Vec::new()));
                        entities.len() - 1
                    }
                };
                let branches = &mut entities[position].1;
                match branches.iter_mut().find(|(c, _)| c.name() == condition.name()) {
                    Some((_, actions)) => {
                        for action in &state.side_effects {
                            actions.push(action.clone());
                        }
                    }
                    None => branches.push((condition, state.side_effects.clone())),
                }
            }
        }

        let mut schema = RawEventSchema::new();
        for (entity_id, branches) in entities {
            let mut conditions = RawConditionSchema::conditions();
            for (condition, actions) in branches {
                conditions = conditions.when(condition, actions);
            }
            schema.insert(format!("state:{}", entity_id), conditions);
        }
        Ok(schema)
    }
}
