//! Host runtime for reloadable home-automation scripts
//!
//! Scripts declare rules (event → condition → actions) through a
//! [`ScriptContext`]. Everything a script registers belongs to one
//! [`Generation`]; the [`ReloadController`] retires the whole generation and
//! loads the next whenever the script directory changes.

pub use homescript_events as events;

pub mod action;
pub mod condition;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod generation;
pub mod loader;
pub mod manager;
pub mod reload;
pub mod schema;
pub mod script;
pub mod script_scanner;
pub mod state_machine;
pub mod supervisor;

pub use action::{Action, ActionList, RawActions};
pub use condition::{property_condition, Condition, ConditionValue, Readable};
pub use config::{ConfigLoadError, HostConfig, ScriptingConfig};
pub use context::ScriptContext;
pub use engine::{DispatchOutcome, RuleEngine};
pub use error::{HostError, LoadError, RuleError, SchemaError, StopTimeout};
pub use generation::{Generation, GenerationCounter};
pub use loader::{ScriptLoader, ScriptSource, TomlScriptLoader, Vocabulary};
pub use manager::{Manager, ManagerRegistry, SubscriptionHandle};
pub use reload::{
    spawn_reload_signal_handler, CycleReport, ReloadController, ReloadSettings, ReloadState,
    ReloadStatus,
};
pub use schema::{
    build_event_schema, ConditionSchema, ConditionSchemaItem, EventSchema, RawConditionSchema,
    RawEventSchema, TriggerMode,
};
pub use script::{Script, ScriptFactory, ScriptRegistry};
pub use script_scanner::{watch_script_dir, ScanResult, ScriptScanner};
pub use state_machine::{State, StateId, StateMachine, StateTrigger};
pub use supervisor::{TaskHandle, TaskSupervisor};
