//! The reload cycle: retire one generation of scripts and load the next
//!
//! Every cycle runs `Stopping → Unloading → Loading → Idle` under one lock,
//! so cycles never overlap. Requests that arrive while a cycle is running set
//! a pending flag and produce exactly one follow-up cycle.

mod signal;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use homescript_events::HostPlatform;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::context::ScriptContext;
use crate::error::{panic_message, HostError, LoadError, StopTimeout};
use crate::generation::{Generation, GenerationCounter};
use crate::loader::{discover_sources, script_id, ScriptLoader, ScriptSource};
use crate::manager::ManagerRegistry;
use crate::script::Script;
use crate::supervisor::TaskSupervisor;

pub use signal::spawn_reload_signal_handler;

/// Phase of the reload state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    Stopping,
    Unloading,
    Loading,
}

/// Outcome of one reload cycle
#[derive(Debug)]
pub struct CycleReport {
    pub generation: Generation,
    /// Ids of the scripts now live, in load order
    pub loaded: Vec<String>,
    pub failed: Vec<LoadError>,
    pub stop_timeouts: Vec<StopTimeout>,
    pub elapsed: Duration,
}

/// Published after every state change
#[derive(Debug, Clone)]
pub struct ReloadStatus {
    pub state: ReloadState,
    pub generation: Generation,
    pub completed_cycles: u64,
    pub last_report: Option<Arc<CycleReport>>,
}

#[derive(Debug, Clone)]
pub struct ReloadSettings {
    pub script_dir: PathBuf,
    /// Per-script tables, keyed by script id
    pub script_config: HashMap<String, toml::Value>,
    /// How long stopping waits for dispatches and tasks before detaching them
    pub stop_grace: Duration,
    /// Quiet period after a request before a cycle starts
    pub debounce: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from("scripts"),
            script_config: HashMap::new(),
            stop_grace: Duration::from_millis(2000),
            debounce: Duration::ZERO,
        }
    }
}

struct LoadedScript {
    id: String,
    instance: Option<Box<dyn Script>>,
}

struct Inner {
    settings: ReloadSettings,
    loaders: Vec<Arc<dyn ScriptLoader>>,
    generations: GenerationCounter,
    supervisor: Arc<TaskSupervisor>,
    registry: Arc<ManagerRegistry>,
    pending: AtomicBool,
    shut_down: AtomicBool,
    wake: Notify,
    status: watch::Sender<ReloadStatus>,
    /// Scripts of the live generation. Held for the whole of a cycle.
    arena: Mutex<Vec<LoadedScript>>,
}

/// Owns the generation counter and drives reload cycles
#[derive(Clone)]
pub struct ReloadController {
    inner: Arc<Inner>,
}

impl ReloadController {
    /// Must be called from within a tokio runtime
    pub fn new(
        host: Arc<dyn HostPlatform>,
        settings: ReloadSettings,
        loaders: Vec<Arc<dyn ScriptLoader>>,
    ) -> Result<Self, HostError> {
        let runtime = Handle::try_current().map_err(|e| HostError::NoRuntime(e.to_string()))?;
        let generations = GenerationCounter::new();
        let supervisor = Arc::new(TaskSupervisor::new(runtime, generations.clone()));
        let registry = Arc::new(ManagerRegistry::new(
            host,
            supervisor.clone(),
            generations.clone(),
            settings.stop_grace,
        ));
        let (status, _) = watch::channel(ReloadStatus {
            state: ReloadState::Idle,
            generation: generations.current(),
            completed_cycles: 0,
            last_report: None,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                loaders,
                generations,
                supervisor,
                registry,
                pending: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                wake: Notify::new(),
                status,
                arena: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn settings(&self) -> &ReloadSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<ManagerRegistry> {
        &self.inner.registry
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.inner.supervisor
    }

    pub fn generation(&self) -> Generation {
        self.inner.generations.current()
    }

    pub fn status(&self) -> ReloadStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReloadStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Ask for a reload. Never blocks; requests made while one is pending or
    /// running are merged.
    pub fn request_reload(&self) {
        if self.is_shut_down() {
            return;
        }
        if !self.inner.pending.swap(true, Ordering::AcqRel) {
            debug!(target: "scripting", "Reload requested");
        }
        self.inner.wake.notify_one();
    }

    /// Serve reload requests until [`Self::shutdown`]. Returns early only on
    /// a fatal bookkeeping fault.
    pub async fn run(&self) -> Result<(), HostError> {
        loop {
            self.inner.wake.notified().await;
            if self.is_shut_down() {
                return Ok(());
            }

            let debounce = self.inner.settings.debounce;
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }

            while self.inner.pending.swap(false, Ordering::AcqRel) {
                if self.is_shut_down() {
                    return Ok(());
                }
                match self.reload_now().await {
                    Ok(_) | Err(HostError::ShutDown) => {}
                    Err(e) if e.is_fatal() => {
                        error!(target: "scripting", "Reload failed: {}", e);
                        return Err(e);
                    }
                    Err(e) => error!(target: "scripting", "Reload failed: {}", e),
                }
            }
        }
    }

    /// Run one full cycle now, waiting for any cycle already in progress
    pub async fn reload_now(&self) -> Result<Arc<CycleReport>, HostError> {
        let mut arena = self.inner.arena.lock().await;
        if self.is_shut_down() {
            return Err(HostError::ShutDown);
        }

        let started = Instant::now();
        let outgoing = self.inner.generations.current();
        let generation = self.inner.generations.advance()?;
        info!(target: "scripting", "Reloading scripts: {} -> {}", outgoing, generation);

        self.publish(ReloadState::Stopping, None);
        let stop_timeouts = self.stop().await?;

        self.publish(ReloadState::Unloading, None);
        self.unload(&mut arena);

        self.publish(ReloadState::Loading, None);
        let (scripts, failed) = self.load(generation).await?;
        let loaded: Vec<String> = scripts.iter().map(|s| s.id.clone()).collect();
        *arena = scripts;

        self.inner.registry.resume(generation);

        let report = Arc::new(CycleReport {
            generation,
            loaded,
            failed,
            stop_timeouts,
            elapsed: started.elapsed(),
        });
        log_report(&report);
        self.publish(ReloadState::Idle, Some(report.clone()));
        Ok(report)
    }

    /// Stop and unload the live generation without loading another
    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.wake.notify_one();

        let mut arena = self.inner.arena.lock().await;
        // Retire the live generation so in-flight deliveries are dropped
        let retired = self.inner.generations.advance();

        self.publish(ReloadState::Stopping, None);
        let timeouts = self.stop().await?;
        self.publish(ReloadState::Unloading, None);
        self.unload(&mut arena);
        self.publish(ReloadState::Idle, None);

        info!(
            target: "scripting",
            "Script host shut down ({} task(s) detached)",
            timeouts.len()
        );
        retired.map(|_| ())
    }

    async fn stop(&self) -> Result<Vec<StopTimeout>, HostError> {
        let registry = self.inner.registry.clone();
        let mut timeouts = tokio::task::spawn_blocking(move || registry.stop_all())
            .await
            .map_err(|e| HostError::Bookkeeping(format!("stopping managers failed: {}", e)))?;

        let cancelled = self
            .inner
            .supervisor
            .cancel_all(self.inner.settings.stop_grace)
            .await;
        if cancelled.stopped > 0 {
            debug!(target: "scripting", "Cancelled {} task(s)", cancelled.stopped);
        }
        timeouts.extend(cancelled.detached);
        Ok(timeouts)
    }

    fn unload(&self, arena: &mut Vec<LoadedScript>) {
        let count = arena.len();
        for mut script in arena.drain(..) {
            let Some(instance) = script.instance.as_mut() else {
                continue;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| instance.on_unload())) {
                warn!(
                    target: "scripting",
                    "Script '{}' panicked while unloading: {}",
                    script.id,
                    panic_message(payload.as_ref())
                );
            }
        }
        self.inner.registry.clear();
        if count > 0 {
            info!(target: "scripting", "Unloaded {} script(s)", count);
        }
    }

    async fn load(
        &self,
        generation: Generation,
    ) -> Result<(Vec<LoadedScript>, Vec<LoadError>), HostError> {
        let inner = self.inner.clone();
        let (scripts, failed) =
            tokio::task::spawn_blocking(move || load_generation(&inner, generation))
                .await
                .map_err(|e| HostError::Bookkeeping(format!("loading scripts failed: {}", e)))?;

        let fatal = failed.iter().find_map(|e| match e {
            LoadError::Host { source, .. } if source.is_fatal() => Some(source.clone()),
            _ => None,
        });
        match fatal {
            Some(e) => Err(e),
            None => Ok((scripts, failed)),
        }
    }

    fn publish(&self, state: ReloadState, report: Option<Arc<CycleReport>>) {
        let generation = self.inner.generations.current();
        self.inner.status.send_modify(|status| {
            status.state = state;
            status.generation = generation;
            if report.is_some() {
                status.completed_cycles += 1;
                status.last_report = report;
            }
        });
    }
}

fn load_generation(inner: &Inner, generation: Generation) -> (Vec<LoadedScript>, Vec<LoadError>) {
    let settings = &inner.settings;
    let mut scripts = Vec::new();
    let mut failed = Vec::new();

    let paths = discover_sources(&settings.script_dir, &inner.loaders, &settings.script_config);
    for path in paths {
        let Some(loader) = inner.loaders.iter().find(|l| l.accepts(&path)) else {
            continue;
        };
        let id = script_id(&path);
        let source = match ScriptSource::read(&path) {
            Ok(source) => source,
            Err(e) => {
                warn!(target: "scripting", "{}", e);
                failed.push(e);
                continue;
            }
        };

        let script_settings = settings
            .script_config
            .get(&id)
            .and_then(|v| v.as_table())
            .cloned()
            .unwrap_or_default();
        let mut ctx = ScriptContext::new(
            id.clone(),
            generation,
            inner.registry.clone(),
            inner.supervisor.clone(),
        )
        .with_settings(script_settings);

        let result = catch_unwind(AssertUnwindSafe(|| loader.load(&source, &mut ctx)))
            .unwrap_or_else(|payload| {
                Err(LoadError::Panicked {
                    script: id.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });

        match result {
            Ok(instance) => {
                debug!(
                    target: "scripting",
                    "Loaded script '{}' with the {} loader ({} subscription(s))",
                    id,
                    loader.name(),
                    ctx.subscriptions().len()
                );
                scripts.push(LoadedScript { id, instance });
            }
            Err(e) => {
                ctx.retract();
                warn!(target: "scripting", "Failed to load script '{}': {}", id, e);
                failed.push(e);
            }
        }
    }

    (scripts, failed)
}

fn log_report(report: &CycleReport) {
    info!(
        target: "scripting",
        "Loaded {} script(s) into {} in {:?}",
        report.loaded.len(),
        report.generation,
        report.elapsed
    );
    if !report.failed.is_empty() {
        warn!(
            target: "scripting",
            "{} script(s) failed to load into {}",
            report.failed.len(),
            report.generation
        );
    }
    if !report.stop_timeouts.is_empty() {
        warn!(
            target: "scripting",
            "{} task(s) were detached while stopping",
            report.stop_timeouts.len()
        );
    }
    if report.loaded.is_empty() && report.failed.is_empty() {
        warn!(target: "scripting", "No scripts loaded after reload");
    }
}
