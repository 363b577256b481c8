#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use homescript_host::events::{EventKind, HostEvent, HostPlatform, Listener, ListenerId};
use homescript_host::{
    Action, Condition, ReloadController, ReloadSettings, ReloadStatus, ScriptLoader,
    ScriptRegistry, TomlScriptLoader, Vocabulary,
};
use tokio::sync::watch;

/// In-memory host that delivers events synchronously on the caller's thread
#[derive(Default)]
pub struct TestHost {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, (EventKind, Listener)>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `event` to every listener of its kind
    pub fn emit(&self, event: &HostEvent) {
        for listener in self.listeners_for(&event.kind) {
            listener(event);
        }
    }

    pub fn emit_bus(&self, name: &str) {
        self.emit(&HostEvent::bus(name, Default::default()));
    }

    pub fn listeners_for(&self, kind: &EventKind) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap()
            .values()
            .filter(|(k, _)| k == kind)
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }
}

impl HostPlatform for TestHost {
    fn listen(&self, kind: &EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap()
            .insert(id, (kind.clone(), listener));
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners.write().unwrap().remove(&id).is_some()
    }
}

/// Shared invocation counter
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// An action that bumps this counter
    pub fn action(&self, name: &str) -> Action {
        let counter = self.clone();
        Action::nullary(name, move || counter.bump())
    }
}

/// Counters behind the standard test vocabulary
#[derive(Clone, Default)]
pub struct Lights {
    pub on: Counter,
    pub off: Counter,
    pub ticks: Counter,
}

impl Lights {
    pub fn vocabulary(&self) -> Vocabulary {
        Vocabulary::new()
            .with_condition(Condition::nullary("is_night", || true))
            .with_condition(Condition::nullary("is_day", || false))
            .with_condition(Condition::nullary("broken_sensor", || {
                panic!("sensor unavailable")
            }))
            .with_action(self.on.action("turn_on_light"))
            .with_action(self.off.action("turn_off_light"))
            .with_action(self.ticks.action("tick"))
    }
}

pub fn write_script(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("Failed to write script");
}

pub fn settings(dir: &Path) -> ReloadSettings {
    ReloadSettings {
        script_dir: dir.to_path_buf(),
        stop_grace: Duration::from_millis(500),
        debounce: Duration::ZERO,
        ..ReloadSettings::default()
    }
}

pub fn controller(
    dir: &Path,
    host: Arc<TestHost>,
    vocabulary: Vocabulary,
    scripts: ScriptRegistry,
) -> ReloadController {
    let loader: Arc<dyn ScriptLoader> =
        Arc::new(TomlScriptLoader::new(vocabulary).with_scripts(scripts));
    ReloadController::new(host, settings(dir), vec![loader]).expect("Failed to create controller")
}

/// Wait until the published status satisfies `predicate`
pub async fn wait_for_status(
    status: &mut watch::Receiver<ReloadStatus>,
    predicate: impl FnMut(&ReloadStatus) -> bool,
) -> ReloadStatus {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(predicate))
        .await
        .expect("Timed out waiting for reload status")
        .expect("Status channel closed")
        .clone()
}
