use tokio::task::JoinHandle;
use tracing::info;

use super::ReloadController;

/// Request a reload whenever the process receives SIGUSR2
#[cfg(unix)]
pub fn spawn_reload_signal_handler(controller: ReloadController) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigusr2 = match signal(SignalKind::user_defined2()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(target: "scripting", "Failed to register SIGUSR2 handler: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while sigusr2.recv().await.is_some() {
            if controller.is_shut_down() {
                break;
            }
            info!(target: "scripting", "Received SIGUSR2 - requesting script reload");
            controller.request_reload();
        }
        info!(target: "scripting", "SIGUSR2 handler stopped");
    }))
}

/// SIGUSR2 does not exist here; reloads come from the directory watcher only
#[cfg(not(unix))]
pub fn spawn_reload_signal_handler(_controller: ReloadController) -> Option<JoinHandle<()>> {
    tracing::warn!(target: "scripting", "SIGUSR2 reload not supported on this platform");
    None
}
