//! Event → condition → action rule structures
//!
//! Scripts describe behavior with the raw builders ([`RawEventSchema`],
//! [`RawConditionSchema`]) and hand them to [`build_event_schema`], which
//! validates and normalizes them into the immutable [`EventSchema`] that
//! managers dispatch against.
//!
//! Each event entry also carries a [`TriggerMode`]. By default a match
//! restarts the owning script: its pending deferred work is cancelled before
//! the matched actions run.
//!
//! ```text
//! motion:
//!   when is_night:
//!     - turn_on_light
//!   when is_day:
//!     - turn_off_light
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use homescript_events::EventKind;

use crate::action::{Action, ActionList, RawActions};
use crate::condition::Condition;
use crate::error::SchemaError;

/// Deepest nesting of condition mappings or action lists accepted
pub const MAX_SCHEMA_DEPTH: usize = 8;

// ============================================================================
// Raw (author-facing) forms
// ============================================================================

/// Value of one condition branch: an action list or a nested mapping
#[derive(Debug, Clone)]
pub enum RawBranch {
    Actions(RawActions),
    Nested(Vec<(Condition, RawBranch)>),
}

/// Condition schema as written: unconditional actions, or an ordered mapping
/// of conditions to branches
#[derive(Debug, Clone)]
pub enum RawConditionSchema {
    Unconditional(RawActions),
    Conditional {
        branches: Vec<(Condition, RawBranch)>,
        exclusive: bool,
    },
}

impl RawConditionSchema {
    /// Actions that always run
    pub fn unconditional(actions: impl Into<RawActions>) -> Self {
        RawConditionSchema::Unconditional(actions.into())
    }

    /// An empty conditional mapping, to be filled with [`Self::when`]
    pub fn conditions() -> Self {
        RawConditionSchema::Conditional {
            branches: Vec::new(),
            exclusive: false,
        }
    }

    /// Append a branch. Calling this on an unconditional schema keeps its
    /// actions as a leading branch that always matches.
    pub fn when(self, condition: Condition, actions: impl Into<RawActions>) -> Self {
        self.push_branch(condition, RawBranch::Actions(actions.into()))
    }

    /// Append a branch whose value is itself a condition schema. A nested
    /// conditional mapping is flattened at build time into branches guarded
    /// by the conjunction of the outer and inner conditions.
    pub fn when_nested(self, condition: Condition, nested: RawConditionSchema) -> Self {
        let branch = match nested {
            RawConditionSchema::Unconditional(actions) => RawBranch::Actions(actions),
            RawConditionSchema::Conditional { branches, .. } => RawBranch::Nested(branches),
        };
        self.push_branch(condition, branch)
    }

    /// Stop at the first branch whose condition holds
    pub fn first_match(self) -> Self {
        match self {
            RawConditionSchema::Conditional { branches, .. } => RawConditionSchema::Conditional {
                branches,
                exclusive: true,
            },
            unconditional => unconditional,
        }
    }

    fn push_branch(self, condition: Condition, branch: RawBranch) -> Self {
        match self {
            RawConditionSchema::Unconditional(actions) => RawConditionSchema::Conditional {
                branches: vec![
                    (Condition::always(), RawBranch::Actions(actions)),
                    (condition, branch),
                ],
                exclusive: false,
            },
            RawConditionSchema::Conditional {
                mut branches,
                exclusive,
            } => {
                branches.push((condition, branch));
                RawConditionSchema::Conditional {
                    branches,
                    exclusive,
                }
            }
        }
    }
}

impl From<RawActions> for RawConditionSchema {
    fn from(actions: RawActions) -> Self {
        RawConditionSchema::Unconditional(actions)
    }
}

impl From<Action> for RawConditionSchema {
    fn from(actions: Action) -> Self {
        RawConditionSchema::Unconditional(actions.into())
    }
}

impl From<Option<Action>> for RawConditionSchema {
    fn from(actions: Option<Action>) -> Self {
        RawConditionSchema::Unconditional(actions.into())
    }
}

impl From<Vec<Action>> for RawConditionSchema {
    fn from(actions: Vec<Action>) -> Self {
        RawConditionSchema::Unconditional(actions.into())
    }
}

impl From<ActionList> for RawConditionSchema {
    fn from(actions: ActionList) -> Self {
        RawConditionSchema::Unconditional(actions.into())
    }
}

/// What a matching event does to work the owning script still has pending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerMode {
    /// Cancel the script's deferred and asynchronous actions, then run
    #[default]
    Restart,
    /// Run alongside whatever is pending
    Parallel,
}

/// Event schema as written: ordered (event key, condition schema) pairs
#[derive(Debug, Clone, Default)]
pub struct RawEventSchema {
    entries: Vec<(String, RawConditionSchema, TriggerMode)>,
}

impl RawEventSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Self::insert`]
    pub fn on(mut self, key: impl Into<String>, schema: impl Into<RawConditionSchema>) -> Self {
        self.insert(key, schema);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, schema: impl Into<RawConditionSchema>) {
        self.insert_with_mode(key, schema, TriggerMode::default());
    }

    /// Builder form of [`Self::insert_with_mode`]
    pub fn on_with_mode(
        mut self,
        key: impl Into<String>,
        schema: impl Into<RawConditionSchema>,
        mode: TriggerMode,
    ) -> Self {
        self.insert_with_mode(key, schema, mode);
        self
    }

    pub fn insert_with_mode(
        &mut self,
        key: impl Into<String>,
        schema: impl Into<RawConditionSchema>,
        mode: TriggerMode,
    ) {
        self.entries.push((key.into(), schema.into(), mode));
    }

    /// Append every entry of `other`, keeping its trigger modes
    pub fn extend(&mut self, other: RawEventSchema) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Built forms
// ============================================================================

/// One guarded branch of a condition schema
#[derive(Debug, Clone)]
pub struct ConditionSchemaItem {
    pub condition: Condition,
    pub actions: ActionList,
}

#[derive(Debug, Clone)]
pub enum ConditionSchema {
    /// Always runs
    Unconditional(ActionList),
    /// Items evaluated in declaration order. Every matching item runs unless
    /// `exclusive` is set, in which case only the first does.
    Conditional {
        items: Vec<ConditionSchemaItem>,
        exclusive: bool,
    },
}

impl ConditionSchema {
    /// All actions in declaration order, regardless of conditions
    pub fn flat_names(&self) -> Vec<&str> {
        match self {
            ConditionSchema::Unconditional(actions) => actions.flat_names(),
            ConditionSchema::Conditional { items, .. } => items
                .iter()
                .flat_map(|item| item.actions.flat_names())
                .collect(),
        }
    }
}

/// Validated mapping from event kind to condition schema
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    owner: Option<Arc<str>>,
    entries: Vec<(EventKind, Arc<ConditionSchema>, TriggerMode)>,
}

impl EventSchema {
    pub fn get(&self, kind: &EventKind) -> Option<&Arc<ConditionSchema>> {
        self.entry(kind).map(|(schema, _)| schema)
    }

    /// Condition schema and trigger mode registered for `kind`
    pub fn entry(&self, kind: &EventKind) -> Option<(&Arc<ConditionSchema>, TriggerMode)> {
        self.entries
            .iter()
            .find(|(k, _, _)| k == kind)
            .map(|(_, schema, mode)| (schema, *mode))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EventKind> {
        self.entries.iter().map(|(k, _, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventKind, &Arc<ConditionSchema>)> {
        self.entries.iter().map(|(k, s, _)| (k, s))
    }

    /// Script whose pending work a restarting match cancels
    pub fn owner(&self) -> Option<&Arc<str>> {
        self.owner.as_ref()
    }

    pub fn with_owner(mut self, owner: impl Into<Arc<str>>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse and validate a raw event schema.
///
/// Pure: nothing here talks to the host. Fails if a key is not a recognized
/// event kind or repeats, if a conditional mapping is empty, or if nesting
/// exceeds [`MAX_SCHEMA_DEPTH`].
pub fn build_event_schema(raw: RawEventSchema) -> Result<EventSchema, SchemaError> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.entries.len());

    for (key, raw_schema, mode) in raw.entries {
        let kind: EventKind = key
            .parse()
            .map_err(|source| SchemaError::UnknownEventKind {
                key: key.clone(),
                source,
            })?;
        if !seen.insert(kind.clone()) {
            return Err(SchemaError::DuplicateEventKind(kind.to_string()));
        }
        let schema = build_condition_schema(&kind, raw_schema)?;
        entries.push((kind, Arc::new(schema), mode));
    }

    Ok(EventSchema {
        owner: None,
        entries,
    })
}

fn build_condition_schema(
    kind: &EventKind,
    raw: RawConditionSchema,
) -> Result<ConditionSchema, SchemaError> {
    match raw {
        RawConditionSchema::Unconditional(actions) => {
            Ok(ConditionSchema::Unconditional(actions.normalize()?))
        }
        RawConditionSchema::Conditional {
            branches,
            exclusive,
        } => {
            let mut items = Vec::new();
            flatten_branches(kind, branches, &[], 0, &mut items)?;
            Ok(ConditionSchema::Conditional { items, exclusive })
        }
    }
}

fn flatten_branches(
    kind: &EventKind,
    branches: Vec<(Condition, RawBranch)>,
    path: &[Condition],
    depth: usize,
    out: &mut Vec<ConditionSchemaItem>,
) -> Result<(), SchemaError> {
    if depth >= MAX_SCHEMA_DEPTH {
        return Err(SchemaError::TooDeep {
            limit: MAX_SCHEMA_DEPTH,
        });
    }
    if branches.is_empty() {
        return Err(SchemaError::EmptyConditionSchema(kind.to_string()));
    }

    for (condition, branch) in branches {
        let mut guard = path.to_vec();
        guard.push(condition);
        match branch {
            RawBranch::Actions(actions) => out.push(ConditionSchemaItem {
                condition: Condition::all(guard),
                actions: actions.normalize_at(depth)?,
            }),
            RawBranch::Nested(inner) => flatten_branches(kind, inner, &guard, depth + 1, out)?,
        }
    }
    Ok(())
}

// ============================================================================
// Display
// ============================================================================

fn write_actions(f: &mut fmt::Formatter<'_>, actions: &ActionList, indent: usize) -> fmt::Result {
    if actions.is_empty() {
        return writeln!(f, "{:indent$}(nothing)", "", indent = indent);
    }
    for action in actions.flatten() {
        writeln!(f, "{:indent$}- {}", "", action.name(), indent = indent)?;
    }
    Ok(())
}

impl ConditionSchema {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            ConditionSchema::Unconditional(actions) => write_actions(f, actions, indent),
            ConditionSchema::Conditional { items, exclusive } => {
                if *exclusive {
                    writeln!(f, "{:indent$}(first match)", "", indent = indent)?;
                }
                for item in items {
                    writeln!(f, "{:indent$}when {}:", "", item.condition, indent = indent)?;
                    write_actions(f, &item.actions, indent + 2)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ConditionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl fmt::Display for EventSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, schema, mode) in &self.entries {
            match mode {
                TriggerMode::Restart => writeln!(f, "{}:", kind)?,
                TriggerMode::Parallel => writeln!(f, "{} (parallel):", kind)?,
            }
            schema.write_indented(f, 2)?;
        }
        Ok(())
    }
}
