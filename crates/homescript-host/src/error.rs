use std::path::PathBuf;
use std::time::Duration;

use homescript_events::ParseEventKindError;

use crate::generation::Generation;

/// A rule structure rejected while it was being built
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unrecognized event key '{key}': {source}")]
    UnknownEventKind {
        key: String,
        #[source]
        source: ParseEventKindError,
    },
    #[error("event '{0}' is declared more than once")]
    DuplicateEventKind(String),
    #[error("condition mapping for '{0}' has no entries")]
    EmptyConditionSchema(String),
    #[error("rule structure nested deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("group '{0}' refers to itself")]
    Cycle(String),
    #[error("unknown {what} '{name}'")]
    UnknownName { what: &'static str, name: String },
    #[error("{0}")]
    Invalid(String),
}

/// A user callback failed while a rule was being evaluated
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("condition '{condition}' failed: {message}")]
    PredicateFailure { condition: String, message: String },
    #[error("action '{action}' failed: {message}")]
    ActionFailure { action: String, message: String },
}

/// A script source could not be loaded into the current generation
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("script '{script}' has invalid rules: {source}")]
    Schema {
        script: String,
        #[source]
        source: SchemaError,
    },
    #[error("script '{script}' asked for unknown native script '{factory}'")]
    UnknownScript { script: String, factory: String },
    #[error("script '{script}' failed to load: {message}")]
    Script { script: String, message: String },
    #[error("script '{script}' panicked while loading: {message}")]
    Panicked { script: String, message: String },
    #[error("script '{script}' could not register: {source}")]
    Host {
        script: String,
        #[source]
        source: HostError,
    },
}

impl LoadError {
    /// Id of the script the failure belongs to, when known
    pub fn script(&self) -> Option<&str> {
        match self {
            LoadError::Io { .. } | LoadError::Parse { .. } => None,
            LoadError::Schema { script, .. }
            | LoadError::UnknownScript { script, .. }
            | LoadError::Script { script, .. }
            | LoadError::Panicked { script, .. }
            | LoadError::Host { script, .. } => Some(script),
        }
    }
}

/// A task or in-flight dispatch ignored cancellation past its grace period
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{task}' ({generation}) did not stop within {grace:?}; detached")]
pub struct StopTimeout {
    pub task: String,
    pub generation: Generation,
    pub grace: Duration,
}

/// Failures of the host's own bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("{0} is no longer the current generation")]
    StaleGeneration(Generation),
    #[error("generation counter exhausted")]
    GenerationExhausted,
    #[error("{manager} manager cannot serve event '{kind}'")]
    WrongManager { manager: String, kind: String },
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
    #[error("the script host has been shut down")]
    ShutDown,
    #[error("reload bookkeeping failed: {0}")]
    Bookkeeping(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl HostError {
    /// Whether this error breaks every later reload guarantee
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HostError::GenerationExhausted | HostError::Bookkeeping(_)
        )
    }
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
