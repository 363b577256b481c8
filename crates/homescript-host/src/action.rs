//! Effects a rule performs when it matches

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use homescript_events::{format_duration, EventPayload};

use crate::error::{panic_message, RuleError, SchemaError};
use crate::schema::MAX_SCHEMA_DEPTH;

/// Boxed future returned by asynchronous actions
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type NullaryEffect = dyn Fn() -> anyhow::Result<()> + Send + Sync;
type UnaryEffect = dyn Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync;
type TaskEffect = dyn Fn(EventPayload) -> TaskFuture + Send + Sync;

#[derive(Clone)]
pub(crate) enum Effect {
    Nullary(Arc<NullaryEffect>),
    Unary(Arc<UnaryEffect>),
    Group(ActionList),
    After { delay: Duration, actions: ActionList },
    Task(Arc<TaskEffect>),
}

/// A named, cloneable effect
#[derive(Clone)]
pub struct Action {
    name: Arc<str>,
    pub(crate) effect: Effect,
}

impl Action {
    pub fn nullary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::try_nullary(name, move || {
            f();
            Ok(())
        })
    }

    pub fn unary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        Self::try_unary(name, move |payload| {
            f(payload);
            Ok(())
        })
    }

    pub fn try_nullary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            effect: Effect::Nullary(Arc::new(f)),
        }
    }

    pub fn try_unary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            effect: Effect::Unary(Arc::new(f)),
        }
    }

    /// An ordered group that runs as one action
    pub fn group(name: impl Into<String>, actions: impl Into<ActionList>) -> Self {
        Self {
            name: Arc::from(name.into()),
            effect: Effect::Group(actions.into()),
        }
    }

    /// Run `actions` once `delay` has passed, as supervised background work
    pub fn after(delay: Duration, actions: impl Into<ActionList>) -> Self {
        Self {
            name: Arc::from(format!("after {}", format_duration(delay))),
            effect: Effect::After {
                delay,
                actions: actions.into(),
            },
        }
    }

    /// Asynchronous work, handed to the task supervisor when dispatched
    pub fn task<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            effect: Effect::Task(Arc::new(move |payload| -> TaskFuture { Box::pin(f(payload)) })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for actions that leave the dispatching thread
    pub fn is_deferred(&self) -> bool {
        matches!(self.effect, Effect::After { .. } | Effect::Task(_))
    }

    /// Run a synchronous effect, catching errors and panics.
    ///
    /// Groups and deferred actions are the engine's business and are not
    /// handled here.
    pub(crate) fn invoke(&self, payload: &EventPayload) -> Result<(), RuleError> {
        let result = match &self.effect {
            Effect::Nullary(f) => catch_unwind(AssertUnwindSafe(|| f())),
            Effect::Unary(f) => catch_unwind(AssertUnwindSafe(|| f(payload))),
            Effect::Group(_) | Effect::After { .. } | Effect::Task(_) => return Ok(()),
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RuleError::ActionFailure {
                action: self.name.to_string(),
                message: format!("{:#}", e),
            }),
            Err(panic) => Err(RuleError::ActionFailure {
                action: self.name.to_string(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.name).finish()
    }
}

/// Ordered sequence of actions. Always normalized: a single action or
/// nothing at all is still a list.
#[derive(Clone, Default)]
pub struct ActionList(Vec<Action>);

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        self.0.push(action);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.0.iter()
    }

    /// Leaf actions in execution order, with groups expanded. Deferred
    /// actions count as leaves.
    pub fn flatten(&self) -> Vec<&Action> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Action>) {
        for action in &self.0 {
            match &action.effect {
                Effect::Group(inner) => inner.flatten_into(out),
                _ => out.push(action),
            }
        }
    }

    /// Names of [`ActionList::flatten`]
    pub fn flat_names(&self) -> Vec<&str> {
        self.flatten().into_iter().map(Action::name).collect()
    }
}

impl fmt::Debug for ActionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl From<Action> for ActionList {
    fn from(action: Action) -> Self {
        ActionList(vec![action])
    }
}

impl From<Vec<Action>> for ActionList {
    fn from(actions: Vec<Action>) -> Self {
        ActionList(actions)
    }
}

impl From<Option<Action>> for ActionList {
    fn from(action: Option<Action>) -> Self {
        ActionList(action.into_iter().collect())
    }
}

impl FromIterator<Action> for ActionList {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        ActionList(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ActionList {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Action list as an author writes it: nothing, one action, or a list whose
/// entries may themselves be lists (nested groups)
#[derive(Debug, Clone, Default)]
pub enum RawActions {
    #[default]
    Nothing,
    One(Action),
    Many(Vec<RawActions>),
}

impl RawActions {
    /// Normalize into an [`ActionList`]. Nested lists become groups; `Nothing`
    /// becomes an empty list, or disappears inside a list.
    pub fn normalize(self) -> Result<ActionList, SchemaError> {
        self.normalize_at(0)
    }

    pub(crate) fn normalize_at(self, depth: usize) -> Result<ActionList, SchemaError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(SchemaError::TooDeep {
                limit: MAX_SCHEMA_DEPTH,
            });
        }
        match self {
            RawActions::Nothing => Ok(ActionList::new()),
            RawActions::One(action) => Ok(ActionList::from(action)),
            RawActions::Many(items) => {
                let mut list = ActionList::new();
                for item in items {
                    match item {
                        RawActions::Nothing => {}
                        RawActions::One(action) => list.push(action),
                        nested @ RawActions::Many(_) => {
                            let inner = nested.normalize_at(depth + 1)?;
                            let name = format!("[{}]", inner.flat_names().join(", "));
                            list.push(Action::group(name, inner));
                        }
                    }
                }
                Ok(list)
            }
        }
    }
}

impl From<Action> for RawActions {
    fn from(action: Action) -> Self {
        RawActions::One(action)
    }
}

impl From<Option<Action>> for RawActions {
    fn from(action: Option<Action>) -> Self {
        match action {
            Some(action) => RawActions::One(action),
            None => RawActions::Nothing,
        }
    }
}

impl From<Vec<Action>> for RawActions {
    fn from(actions: Vec<Action>) -> Self {
        RawActions::Many(actions.into_iter().map(RawActions::One).collect())
    }
}

impl From<Vec<RawActions>> for RawActions {
    fn from(items: Vec<RawActions>) -> Self {
        RawActions::Many(items)
    }
}

impl From<ActionList> for RawActions {
    fn from(list: ActionList) -> Self {
        RawActions::Many(list.0.into_iter().map(RawActions::One).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn named(name: &str) -> Action {
        Action::nullary(name, || {})
    }

    #[test]
    fn test_nothing_normalizes_to_empty_list() {
        let list = RawActions::Nothing.normalize().unwrap();
        assert!(list.is_empty());
        assert!(RawActions::from(None::<Action>).normalize().unwrap().is_empty());
    }

    #[test]
    fn test_single_action_normalizes_to_list() {
        let list = RawActions::from(named("turn_on_light")).normalize().unwrap();
        assert_eq!(list.flat_names(), vec!["turn_on_light"]);
    }

    #[test]
    fn test_nested_lists_become_groups_in_order() {
        let raw = RawActions::Many(vec![
            named("a").into(),
            RawActions::Many(vec![named("b").into(), RawActions::Nothing, named("c").into()]),
            RawActions::Nothing,
            named("d").into(),
        ]);
        let list = raw.normalize().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.flat_names(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut raw = RawActions::from(named("leaf"));
        for _ in 0..=MAX_SCHEMA_DEPTH + 1 {
            raw = RawActions::Many(vec![raw]);
        }
        assert!(matches!(raw.normalize(), Err(SchemaError::TooDeep { .. })));
    }

    #[test]
    fn test_invoke_passes_payload_and_isolates_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = {
            let seen = seen.clone();
            Action::unary("record", move |payload| {
                seen.lock().unwrap().push(payload.clone());
            })
        };
        record.invoke(&EventPayload::Tick { sequence: 7 }).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![EventPayload::Tick { sequence: 7 }]);

        let failing = Action::try_nullary("toggle", || anyhow::bail!("device unreachable"));
        assert!(matches!(
            failing.invoke(&EventPayload::None),
            Err(RuleError::ActionFailure { ref action, .. }) if action == "toggle"
        ));

        let panicking = Action::nullary("boom", || panic!("bad"));
        assert!(panicking.invoke(&EventPayload::None).is_err());
    }

    #[test]
    fn test_deferred_actions() {
        let delayed = Action::after(Duration::from_secs(2), named("b"));
        assert!(delayed.is_deferred());
        assert_eq!(delayed.name(), "after 2s");

        let task = Action::task("fetch", |_payload| async { anyhow::Ok(()) });
        assert!(task.is_deferred());
        assert!(!named("a").is_deferred());
    }
}
