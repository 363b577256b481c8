use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::ScriptContext;

/// A script compiled into the host
///
/// A fresh instance is created for every generation that loads it and is
/// dropped when that generation is unloaded.
pub trait Script: Send + 'static {
    /// Unique identifier for this script (e.g., "presence_logger")
    fn id(&self) -> &str;

    /// Description of what this script does
    fn description(&self) -> &str {
        ""
    }

    /// Register rules and start work. An error fails this script only.
    fn on_load(&mut self, ctx: &mut ScriptContext) -> anyhow::Result<()>;

    /// Called before the instance is dropped at unload
    fn on_unload(&mut self) {}
}

pub type ScriptFactory = Arc<dyn Fn() -> Box<dyn Script> + Send + Sync>;

/// Factories for native scripts, keyed by the name rule files use
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    factories: BTreeMap<String, ScriptFactory>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Script>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn available_scripts(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Register several native scripts at once
///
/// ```ignore
/// register_scripts!(registry, "presence_logger" => PresenceLogger::default);
/// ```
#[macro_export]
macro_rules! register_scripts {
    ($registry:expr, $($name:expr => $factory:expr),* $(,)?) => {
        $(
            $registry.register($name, || Box::new(($factory)()) as Box<dyn $crate::Script>);
        )*
    };
}
