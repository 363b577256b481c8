use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::error::HostError;
use crate::generation::Generation;
use crate::manager::{ManagerRegistry, SubscriptionHandle};
use crate::schema::{build_event_schema, EventSchema, RawEventSchema};
use crate::supervisor::{TaskHandle, TaskSupervisor};

/// What a script sees while it loads
///
/// Everything registered through a context belongs to the context's
/// generation and is retired with it.
pub struct ScriptContext {
    script_id: String,
    generation: Generation,
    registry: Arc<ManagerRegistry>,
    supervisor: Arc<TaskSupervisor>,
    settings: toml::Table,
    subscriptions: Vec<SubscriptionHandle>,
    tasks: Vec<TaskHandle>,
}

impl ScriptContext {
    pub fn new(
        script_id: impl Into<String>,
        generation: Generation,
        registry: Arc<ManagerRegistry>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            script_id: script_id.into(),
            generation,
            registry,
            supervisor,
            settings: toml::Table::new(),
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: toml::Table) -> Self {
        self.settings = settings;
        self
    }

    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Per-script settings from the rule file or host configuration
    pub fn settings(&self) -> &toml::Table {
        &self.settings
    }

    /// Add entries from `settings` that are not already set
    pub fn extend_settings(&mut self, settings: toml::Table) {
        for (key, value) in settings {
            self.settings.entry(key).or_insert(value);
        }
    }

    /// Build `raw` and subscribe it. Returns the number of event kinds bound.
    pub fn add_event_schema(&mut self, raw: RawEventSchema) -> Result<usize, HostError> {
        let schema = build_event_schema(raw)?;
        self.register(schema)
    }

    /// Subscribe an already built schema
    pub fn register(&mut self, schema: EventSchema) -> Result<usize, HostError> {
        debug!(
            target: "scripting",
            "Registering rules for '{}' ({}):\n{}",
            self.script_id,
            self.generation,
            schema
        );
        let handles = self
            .registry
            .register(&self.script_id, self.generation, schema)?;
        let count = handles.len();
        self.subscriptions.extend(handles);
        Ok(count)
    }

    /// Run `work` in the background under this script's generation
    pub fn spawn<F>(&mut self, name: impl Into<String>, work: F) -> Option<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("{}/{}", self.script_id, name.into());
        let handle = self.supervisor.spawn(name, self.generation, work)?;
        self.tasks.push(handle.clone());
        Some(handle)
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    /// Undo everything registered through this context. Used when the script
    /// fails partway through loading.
    pub fn retract(&mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let removed = self.registry.unregister(&self.script_id, &subscriptions);
        let mut cancelled = 0;
        for task in self.tasks.drain(..) {
            if self.supervisor.cancel(&task) {
                cancelled += 1;
            }
        }
        if removed > 0 || cancelled > 0 {
            debug!(
                target: "scripting",
                "Retracted {} subscription(s) and {} task(s) of '{}'",
                removed,
                cancelled,
                self.script_id
            );
        }
    }
}
