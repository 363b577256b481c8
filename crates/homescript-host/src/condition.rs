//! Predicates that decide which branch of a rule runs
//!
//! A [`Condition`] wraps either a zero-argument predicate or one that receives
//! the event payload. The arity is chosen by the constructor the caller uses;
//! the engine never inspects the callable. Conditions compose with `!`, `&`
//! and `|`.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use homescript_events::EventPayload;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{panic_message, RuleError};

type NullaryPredicate = dyn Fn() -> anyhow::Result<bool> + Send + Sync;
type UnaryPredicate = dyn Fn(&EventPayload) -> anyhow::Result<bool> + Send + Sync;

#[derive(Clone)]
enum Predicate {
    Nullary(Arc<NullaryPredicate>),
    Unary(Arc<UnaryPredicate>),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

/// A named, cloneable predicate
#[derive(Clone)]
pub struct Condition {
    name: Arc<str>,
    predicate: Predicate,
}

impl Condition {
    /// Wrap a predicate that ignores the event
    pub fn nullary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::try_nullary(name, move || Ok(f()))
    }

    /// Wrap a predicate that inspects the event payload
    pub fn unary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EventPayload) -> bool + Send + Sync + 'static,
    {
        Self::try_unary(name, move |payload| Ok(f(payload)))
    }

    pub fn try_nullary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            predicate: Predicate::Nullary(Arc::new(f)),
        }
    }

    pub fn try_unary<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EventPayload) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            predicate: Predicate::Unary(Arc::new(f)),
        }
    }

    /// A condition that always holds
    pub fn always() -> Self {
        Self::nullary("always", || true)
    }

    /// Holds when a state change came from one of `states`. False for
    /// anything that is not a state change or has no previous state.
    pub fn old_state_in<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states: BTreeSet<String> = states.into_iter().map(Into::into).collect();
        let name = format!("old_states[{}]", join_states(&states));
        Self::unary(name, move |payload| {
            payload.old_state().is_some_and(|old| states.contains(old))
        })
    }

    /// Holds when a state change went to one of `states`
    pub fn new_state_in<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states: BTreeSet<String> = states.into_iter().map(Into::into).collect();
        let name = format!("new_states[{}]", join_states(&states));
        Self::unary(name, move |payload| {
            payload.new_state().is_some_and(|new| states.contains(new))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the wrapped predicate takes the event payload
    pub fn is_unary(&self) -> bool {
        matches!(self.predicate, Predicate::Unary(_))
    }

    /// Evaluate against an event payload.
    ///
    /// Errors and panics raised by the wrapped callable come back as
    /// [`RuleError::PredicateFailure`]; they never unwind into the caller.
    pub fn evaluate(&self, payload: &EventPayload) -> Result<bool, RuleError> {
        match &self.predicate {
            Predicate::Nullary(f) => self.guard(|| f()),
            Predicate::Unary(f) => self.guard(|| f(payload)),
            Predicate::Not(inner) => inner.evaluate(payload).map(|v| !v),
            Predicate::All(members) => {
                for member in members {
                    if !member.evaluate(payload)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(members) => {
                for member in members {
                    if member.evaluate(payload)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn guard(&self, call: impl FnOnce() -> anyhow::Result<bool>) -> Result<bool, RuleError> {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RuleError::PredicateFailure {
                condition: self.name.to_string(),
                message: format!("{:#}", e),
            }),
            Err(payload) => Err(RuleError::PredicateFailure {
                condition: self.name.to_string(),
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }

    /// Conjunction of several conditions, in order
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        let members: Vec<Condition> = conditions
            .into_iter()
            .flat_map(|c| match c.predicate {
                Predicate::All(inner) => inner,
                _ => vec![c],
            })
            .collect();
        if members.len() == 1 {
            return members.into_iter().next().unwrap_or_else(Self::always);
        }
        let name = join_names(&members, " & ");
        Self {
            name: Arc::from(name),
            predicate: Predicate::All(members),
        }
    }

    /// Disjunction of several conditions, in order
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        let members: Vec<Condition> = conditions
            .into_iter()
            .flat_map(|c| match c.predicate {
                Predicate::Any(inner) => inner,
                _ => vec![c],
            })
            .collect();
        let name = join_names(&members, " | ");
        Self {
            name: Arc::from(name),
            predicate: Predicate::Any(members),
        }
    }

    /// A value that follows this condition: `on_true` while it holds,
    /// `on_false` otherwise
    pub fn choose<T>(self, on_true: T, on_false: T) -> ConditionValue<T>
    where
        T: Clone + Send + Sync,
    {
        ConditionValue {
            condition: self,
            on_true,
            on_false,
        }
    }
}

fn join_states(states: &BTreeSet<String>) -> String {
    states.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn join_names(members: &[Condition], separator: &str) -> String {
    let names: Vec<&str> = members.iter().map(Condition::name).collect();
    format!("({})", names.join(separator))
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.name).finish()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        if let Predicate::Not(inner) = self.predicate {
            return *inner;
        }
        Condition {
            name: Arc::from(format!("!{}", self.name)),
            predicate: Predicate::Not(Box::new(self)),
        }
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        Condition::all([self, rhs])
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        Condition::any([self, rhs])
    }
}

// ============================================================================
// Readable values
// ============================================================================

/// Something whose current value can be read at evaluation time
pub trait Readable<T>: Send + Sync {
    fn read(&self) -> T;
}

impl Readable<bool> for AtomicBool {
    fn read(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + Sync> Readable<T> for RwLock<T> {
    fn read(&self) -> T {
        match RwLock::read(self) {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<T: Clone + Send + Sync> Readable<T> for watch::Receiver<T> {
    fn read(&self) -> T {
        self.borrow().clone()
    }
}

/// A condition that reads a boolean property each time it is evaluated
pub fn property_condition<R>(name: impl Into<String>, source: Arc<R>) -> Condition
where
    R: Readable<bool> + ?Sized + 'static,
{
    Condition::nullary(name, move || source.read())
}

/// Value selected by a condition at read time
#[derive(Debug, Clone)]
pub struct ConditionValue<T> {
    condition: Condition,
    on_true: T,
    on_false: T,
}

impl<T: Clone + Send + Sync> Readable<T> for ConditionValue<T> {
    fn read(&self) -> T {
        match self.condition.evaluate(&EventPayload::None) {
            Ok(true) => self.on_true.clone(),
            Ok(false) => self.on_false.clone(),
            Err(e) => {
                warn!(target: "rules", "{}; using false branch", e);
                self.on_false.clone()
            }
        }
    }
}
