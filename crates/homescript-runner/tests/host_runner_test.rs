use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use homescript_events::HostEvent;
use homescript_host::{
    Action, ReloadState, ScriptLoader, ScriptingConfig, TomlScriptLoader, Vocabulary,
};
use homescript_runner::{EventBus, HostRunner};
use tempfile::TempDir;
use tokio::sync::watch;

fn config(dir: &std::path::Path) -> ScriptingConfig {
    ScriptingConfig {
        script_dir: Some(dir.to_path_buf()),
        hot_reload_interval_ms: 20,
        stop_grace_ms: 200,
        reload_debounce_ms: 0,
        ..ScriptingConfig::default()
    }
}

fn loaders(count: &Arc<AtomicUsize>) -> Vec<Arc<dyn ScriptLoader>> {
    let count = count.clone();
    let vocabulary = Vocabulary::new().with_action(Action::nullary("count", move || {
        count.fetch_add(1, Ordering::SeqCst);
    }));
    vec![Arc::new(TomlScriptLoader::new(vocabulary))]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runner_serves_events_and_hot_reloads() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(
        temp_dir.path().join("motion.toml"),
        "[[rules]]\nevent = \"motion\"\nactions = [\"count\"]\n",
    )
    .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let bus = EventBus::new(16);
    let runner = HostRunner::new(config(temp_dir.path()), bus.clone(), loaders(&count))
        .expect("Failed to create runner");
    let controller = runner.controller().clone();
    let mut status = controller.subscribe_status();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(runner.run(shutdown_rx));

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.completed_cycles >= 1 && s.state == ReloadState::Idle),
    )
    .await
    .expect("initial load timed out")
    .unwrap();

    assert_eq!(bus.publish(HostEvent::bus("motion", Default::default())), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Rename the event; the watcher should pick it up and reload
    std::fs::write(
        temp_dir.path().join("motion.toml"),
        "[[rules]]\nevent = \"doorbell\"\nactions = [\"count\"]\n",
    )
    .unwrap();
    let file = std::fs::File::options()
        .write(true)
        .open(temp_dir.path().join("motion.toml"))
        .unwrap();
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.completed_cycles >= 2 && s.state == ReloadState::Idle),
    )
    .await
    .expect("hot reload timed out")
    .unwrap();

    assert_eq!(bus.publish(HostEvent::bus("motion", Default::default())), 0);
    assert_eq!(bus.publish(HostEvent::bus("doorbell", Default::default())), 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("runner did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(bus.listener_count(), 0);
    assert!(controller.is_shut_down());
}

#[tokio::test]
async fn test_disabled_scripting_waits_for_shutdown() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = config(temp_dir.path());
    config.enabled = false;

    let count = Arc::new(AtomicUsize::new(0));
    let runner = HostRunner::new(config, EventBus::default(), loaders(&count)).unwrap();
    let controller = runner.controller().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(runner.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.status().completed_cycles, 0);

    drop(shutdown_tx);
    run.await.unwrap().unwrap();
}
