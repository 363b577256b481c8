use std::sync::Arc;

use homescript_host::{
    spawn_reload_signal_handler, watch_script_dir, HostError, ReloadController, ScriptLoader,
    ScriptScanner, ScriptingConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Wires the reload controller to the event bus, the directory watcher and
/// the reload signal
pub struct HostRunner {
    config: ScriptingConfig,
    bus: EventBus,
    controller: ReloadController,
}

impl HostRunner {
    /// Must be called from within a tokio runtime
    pub fn new(
        config: ScriptingConfig,
        bus: EventBus,
        loaders: Vec<Arc<dyn ScriptLoader>>,
    ) -> Result<Self, RunnerError> {
        let controller =
            ReloadController::new(Arc::new(bus.clone()), config.reload_settings(), loaders)?;
        Ok(Self {
            config,
            bus,
            controller,
        })
    }

    pub fn controller(&self) -> &ReloadController {
        &self.controller
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Load scripts and serve reloads until `shutdown` turns true or its
    /// sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        if !self.config.enabled {
            info!(target: "scripting", "Scripting is disabled");
            stop_requested(&mut shutdown).await;
            return Ok(());
        }

        info!(
            target: "scripting",
            "Loading scripts from {}",
            self.config.script_dir().display()
        );
        // Snapshot the directory first so edits made during the initial load
        // still trigger a reload
        let scanner = if self.config.hot_reload {
            Some(ScriptScanner::with_interval(
                self.config.script_dir(),
                self.config.hot_reload_interval(),
            ))
        } else {
            info!(target: "scripting", "Hot reload is disabled");
            None
        };
        self.controller.reload_now().await?;

        let controller = self.controller.clone();
        let mut reload_loop = tokio::spawn(async move { controller.run().await });

        let watcher: Option<JoinHandle<()>> = scanner
            .map(|scanner| tokio::spawn(watch_script_dir(scanner, self.controller.clone())));
        let signal = spawn_reload_signal_handler(self.controller.clone());

        let mut loop_finished = false;
        let outcome = tokio::select! {
            result = &mut reload_loop => {
                loop_finished = true;
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(target: "scripting", "Reload loop stopped: {}", e);
                        Err(RunnerError::from(e))
                    }
                    Err(e) => Err(RunnerError::from(e)),
                }
            }
            _ = stop_requested(&mut shutdown) => {
                info!(target: "scripting", "Shutting down script host");
                Ok(())
            }
        };

        if let Err(e) = self.controller.shutdown().await {
            warn!(target: "scripting", "Script host shutdown was incomplete: {}", e);
        }
        for task in [watcher, signal].into_iter().flatten() {
            task.abort();
        }
        if !loop_finished {
            reload_loop.await??;
        }
        outcome
    }
}

/// Resolves once `shutdown` is true or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
