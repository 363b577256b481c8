//! Tracking of background work spawned on behalf of scripts
//!
//! Every task is tagged with the generation that spawned it. A reload calls
//! [`TaskSupervisor::cancel_all`], which signals every tracked task, waits up
//! to a grace period, and detaches whatever is still running.
//!
//! Work deferred by a rule is also tagged with the script that owns it, so a
//! fresh trigger can drop that script's pending actions with
//! [`TaskSupervisor::cancel_owner`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StopTimeout;
use crate::generation::{Generation, GenerationCounter};

/// Unique identifier for a supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Caller's reference to a supervised task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: Arc<str>,
    generation: Generation,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

struct TrackedTask {
    name: Arc<str>,
    generation: Generation,
    owner: Option<Arc<str>>,
    handle: JoinHandle<()>,
}

struct SupervisorState {
    cancel: watch::Sender<bool>,
    tasks: HashMap<TaskId, TrackedTask>,
}

/// Outcome of [`TaskSupervisor::cancel_all`]
#[derive(Debug, Default, Clone)]
pub struct CancelReport {
    /// Tasks that observed cancellation or finished in time
    pub stopped: usize,
    /// Tasks abandoned after the grace period
    pub detached: Vec<StopTimeout>,
}

pub struct TaskSupervisor {
    runtime: Handle,
    generations: GenerationCounter,
    next_id: AtomicU64,
    state: Mutex<SupervisorState>,
}

impl TaskSupervisor {
    pub fn new(runtime: Handle, generations: GenerationCounter) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            runtime,
            generations,
            next_id: AtomicU64::new(0),
            state: Mutex::new(SupervisorState {
                cancel,
                tasks: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start `work` under `generation`.
    ///
    /// Returns `None` without running anything if `generation` is no longer
    /// current. Errors returned by the work are logged.
    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        generation: Generation,
        work: F,
    ) -> Option<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_tagged(name, generation, None, work)
    }

    /// Like [`spawn`](Self::spawn), but the task can later be cancelled as
    /// part of `owner`'s pending work.
    pub fn spawn_owned<F>(
        &self,
        name: impl Into<String>,
        generation: Generation,
        owner: Arc<str>,
        work: F,
    ) -> Option<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_tagged(name, generation, Some(owner), work)
    }

    fn spawn_tagged<F>(
        &self,
        name: impl Into<String>,
        generation: Generation,
        owner: Option<Arc<str>>,
        work: F,
    ) -> Option<TaskHandle>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let mut state = self.lock();

        if !self.generations.is_current(generation) {
            debug!(target: "scripting", "Refusing task '{}' from stale {}", name, generation);
            return None;
        }

        state.tasks.retain(|_, task| !task.handle.is_finished());

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let signal = state.cancel.subscribe();
        let task_name = name.clone();

        let handle = self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled(signal) => {
                    debug!(target: "scripting", "Task '{}' cancelled", task_name);
                }
                result = work => {
                    if let Err(e) = result {
                        warn!(target: "scripting", "Task '{}' failed: {:#}", task_name, e);
                    }
                }
            }
        });

        state.tasks.insert(
            id,
            TrackedTask {
                name: name.clone(),
                generation,
                owner,
                handle,
            },
        );

        Some(TaskHandle {
            id,
            name,
            generation,
        })
    }

    /// Abort a single task. Returns false if it had already finished or was
    /// never tracked here.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        match self.lock().tasks.remove(&handle.id) {
            Some(task) => {
                let running = !task.handle.is_finished();
                task.handle.abort();
                running
            }
            None => false,
        }
    }

    /// Abort every running task tagged with `owner` and return how many were
    /// still running. Untagged tasks are left alone.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let mut state = self.lock();
        let ids: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, task)| task.owner.as_deref() == Some(owner))
            .map(|(id, _)| *id)
            .collect();

        let mut aborted = 0;
        for id in ids {
            if let Some(task) = state.tasks.remove(&id) {
                if !task.handle.is_finished() {
                    aborted += 1;
                }
                task.handle.abort();
            }
        }
        if aborted > 0 {
            debug!(target: "scripting", "Cancelled {} pending task(s) of '{}'", aborted, owner);
        }
        aborted
    }

    /// Number of tracked tasks still running
    pub fn active_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Cancel every tracked task and wait, at most `grace` in total, for them
    /// to stop. Stragglers are detached and reported, never joined.
    pub async fn cancel_all(&self, grace: Duration) -> CancelReport {
        let (cancel, tasks) = {
            let mut state = self.lock();
            let (fresh, _) = watch::channel(false);
            let cancel = std::mem::replace(&mut state.cancel, fresh);
            (cancel, std::mem::take(&mut state.tasks))
        };
        cancel.send_replace(true);

        let mut report = CancelReport::default();
        if tasks.is_empty() {
            return report;
        }

        debug!(target: "scripting", "Cancelling {} task(s)", tasks.len());
        let deadline = tokio::time::Instant::now() + grace;

        for (_, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => report.stopped += 1,
                Ok(Err(e)) => {
                    if e.is_panic() {
                        warn!(target: "scripting", "Task '{}' panicked", task.name);
                    }
                    report.stopped += 1;
                }
                Err(_) => {
                    let timeout = StopTimeout {
                        task: task.name.to_string(),
                        generation: task.generation,
                        grace,
                    };
                    warn!(target: "scripting", "{}", timeout);
                    report.detached.push(timeout);
                }
            }
        }

        report
    }
}

/// Resolves once the cancel flag is raised. Pends forever if the sender goes
/// away without raising it.
async fn cancelled(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn supervisor() -> (TaskSupervisor, GenerationCounter, Generation) {
        let generations = GenerationCounter::new();
        let generation = generations.advance().unwrap();
        (
            TaskSupervisor::new(Handle::current(), generations.clone()),
            generations,
            generation,
        )
    }

    #[tokio::test]
    async fn test_spawn_runs_work() {
        let (supervisor, _, generation) = supervisor();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = supervisor
            .spawn("notify", generation, async move {
                let _ = tx.send(42);
                anyhow::Ok(())
            })
            .expect("current generation should be accepted");

        assert_eq!(handle.name(), "notify");
        assert_eq!(handle.generation(), generation);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_refuses_stale_generation() {
        let (supervisor, generations, stale) = supervisor();
        generations.advance().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = supervisor.spawn("late", stale, async move {
            flag.store(true, Ordering::SeqCst);
            anyhow::Ok(())
        });

        assert!(handle.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_cooperative_tasks() {
        let (supervisor, _, generation) = supervisor();
        for i in 0..3 {
            supervisor.spawn(format!("sleeper-{}", i), generation, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            });
        }
        assert_eq!(supervisor.active_count(), 3);

        let report = supervisor.cancel_all(Duration::from_millis(500)).await;
        assert_eq!(report.stopped, 3);
        assert!(report.detached.is_empty());
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_all_detaches_stubborn_tasks() {
        let (supervisor, _, generation) = supervisor();
        supervisor.spawn("stubborn", generation, async {
            // Never yields, so the cancel signal cannot be observed
            std::thread::sleep(Duration::from_millis(400));
            anyhow::Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let report = supervisor.cancel_all(Duration::from_millis(50)).await;

        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(report.stopped, 0);
        assert_eq!(report.detached.len(), 1);
        assert_eq!(report.detached[0].task, "stubborn");
        assert_eq!(report.detached[0].generation, generation);
    }

    #[tokio::test]
    async fn test_tasks_spawned_after_cancel_all_are_tracked_fresh() {
        let (supervisor, _, generation) = supervisor();
        supervisor.cancel_all(Duration::from_millis(10)).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        supervisor.spawn("after", generation, async move {
            let _ = tx.send(());
            anyhow::Ok(())
        });
        assert!(rx.await.is_ok(), "new tasks must not see the old cancel signal");
    }

    #[tokio::test]
    async fn test_cancel_single_task() {
        let (supervisor, _, generation) = supervisor();
        let handle = supervisor
            .spawn("long", generation, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            })
            .unwrap();

        assert!(supervisor.cancel(&handle));
        assert!(!supervisor.cancel(&handle));
    }

    #[tokio::test]
    async fn test_cancel_owner_only_touches_tagged_tasks() {
        let (supervisor, _, generation) = supervisor();
        let owner: Arc<str> = Arc::from("lights");
        for i in 0..2 {
            supervisor.spawn_owned(format!("deferred-{}", i), generation, owner.clone(), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                anyhow::Ok(())
            });
        }
        supervisor.spawn_owned("other", generation, Arc::from("presence"), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        });
        supervisor.spawn("heartbeat", generation, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(())
        });
        assert_eq!(supervisor.active_count(), 4);

        assert_eq!(supervisor.cancel_owner("lights"), 2);
        assert_eq!(supervisor.cancel_owner("lights"), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supervisor.active_count(), 2);
    }
}
