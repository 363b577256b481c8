use std::collections::BTreeMap;

use crate::action::Action;
use crate::condition::Condition;
use crate::error::SchemaError;

/// Named conditions and actions that rule files may refer to
#[derive(Clone, Default)]
pub struct Vocabulary {
    conditions: BTreeMap<String, Condition>,
    actions: BTreeMap<String, Action>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a condition under its own name
    pub fn add_condition(&mut self, condition: Condition) -> &mut Self {
        self.conditions
            .insert(condition.name().to_string(), condition);
        self
    }

    /// Register an action under its own name
    pub fn add_action(&mut self, action: Action) -> &mut Self {
        self.actions.insert(action.name().to_string(), action);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.add_condition(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.add_action(action);
        self
    }

    pub fn condition(&self, name: &str) -> Result<Condition, SchemaError> {
        self.conditions
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownName {
                what: "condition",
                name: name.to_string(),
            })
    }

    pub fn action(&self, name: &str) -> Result<Action, SchemaError> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownName {
                what: "action",
                name: name.to_string(),
            })
    }

    pub fn condition_names(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}
