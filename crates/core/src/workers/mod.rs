//! The stage worker pool.
//!
//! A fixed set of named workers, each bound to one [`WorkerKey`]. The key
//! is the worker-binding identity; it maps onto the queue stage the worker
//! drains, so several worker classes could serve one stage without
//! overloading the stage enum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{Item, Queue, Stage, Status, Trouble};

/// How long a worker waits for its current item to reach a stage boundary
/// after shutdown before marking it `Cancelling`.
const SHUTDOWN_BOUNDARY_WAIT: Duration = Duration::from_secs(2);

/// Worker-binding identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKey {
    TitleParser,
    MetadataLookup,
    Persister,
}

impl WorkerKey {
    /// The queue stage this worker class drains.
    pub fn stage(&self) -> Stage {
        match self {
            WorkerKey::TitleParser => Stage::Title,
            WorkerKey::MetadataLookup => Stage::Metadata,
            WorkerKey::Persister => Stage::Persist,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WorkerKey::TitleParser => "Title",
            WorkerKey::MetadataLookup => "Metadata",
            WorkerKey::Persister => "Persist",
        }
    }

    const ALL: [WorkerKey; 3] = [
        WorkerKey::TitleParser,
        WorkerKey::MetadataLookup,
        WorkerKey::Persister,
    ];
}

/// Per-stage processing logic executed by workers.
///
/// A task returns `Ok` to advance the item, or the trouble that should park
/// it. Recoverable conditions park as `NeedsResolving`, fatal ones as
/// `NeedsAttention` (the trouble itself knows which).
#[async_trait]
pub trait StageTask: Send + Sync {
    fn key(&self) -> WorkerKey;

    async fn run(&self, item: &Item) -> Result<(), Trouble>;
}

/// Fixed pool of stage workers.
pub struct WorkerPool {
    queue: Arc<Queue>,
    shutdown: broadcast::Sender<()>,
    wakeups: HashMap<WorkerKey, Arc<Notify>>,
    handles: StdMutex<Vec<(String, JoinHandle<()>)>>,
}

impl WorkerPool {
    /// Create a pool sharing the orchestrator's shutdown channel.
    pub fn new(queue: Arc<Queue>, shutdown: broadcast::Sender<()>) -> Self {
        let wakeups = WorkerKey::ALL
            .iter()
            .map(|key| (*key, Arc::new(Notify::new())))
            .collect();
        Self {
            queue,
            shutdown,
            wakeups,
            handles: StdMutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers bound to the task's key.
    pub fn spawn_workers(&self, count: usize, task: Arc<dyn StageTask>) {
        let key = task.key();
        let mut handles = self.handles.lock().unwrap();
        for i in 0..count {
            let name = format!("{}:{}", key.name(), i);
            let handle = spawn_worker(
                name.clone(),
                key,
                Arc::clone(&task),
                Arc::clone(&self.queue),
                self.wakeup_for(key),
                self.shutdown.subscribe(),
            );
            handles.push((name, handle));
        }
        info!(count, key = ?key, "spawned stage workers");
    }

    fn wakeup_for(&self, key: WorkerKey) -> Arc<Notify> {
        // All keys are pre-registered in new().
        Arc::clone(&self.wakeups[&key])
    }

    /// Wake the workers of one key.
    pub fn wakeup(&self, key: WorkerKey) {
        let notify = self.wakeup_for(key);
        // Leave a permit for a worker between waits, and wake the rest.
        notify.notify_one();
        notify.notify_waiters();
    }

    /// Wake workers of the key serving a given stage, if any.
    pub fn wakeup_stage(&self, stage: Stage) {
        for key in WorkerKey::ALL {
            if key.stage() == stage {
                self.wakeup(key);
            }
        }
    }

    /// Wake every worker.
    pub fn wakeup_all(&self) {
        for key in WorkerKey::ALL {
            self.wakeup(key);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Join all workers. Called after the shutdown channel has fired.
    pub async fn close(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.handles.lock().unwrap());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(worker = %name, error = %e, "worker join failed");
            }
        }
        info!("worker pool closed");
    }
}

fn spawn_worker(
    name: String,
    key: WorkerKey,
    task: Arc<dyn StageTask>,
    queue: Arc<Queue>,
    wakeup: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(worker = %name, "worker started");
        let stage = key.stage();
        loop {
            // Register interest before picking, so a wakeup sent between
            // the empty pick and the wait is not lost.
            let notified = wakeup.notified();

            let Some(item) = queue.pick(stage) else {
                tokio::select! {
                    _ = notified => continue,
                    _ = shutdown_rx.recv() => break,
                }
            };

            let run = task.run(&item);
            tokio::pin!(run);

            let (outcome, shutting_down) = tokio::select! {
                outcome = &mut run => (outcome, false),
                _ = shutdown_rx.recv() => {
                    // Let the item reach its stage boundary briefly; park it
                    // as cancelling otherwise and wait for release.
                    match tokio::time::timeout(SHUTDOWN_BOUNDARY_WAIT, &mut run).await {
                        Ok(outcome) => (outcome, true),
                        Err(_) => {
                            let _ = queue.set_status(item.id, Status::Cancelling);
                            ((&mut run).await, true)
                        }
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    if let Err(e) = queue.advance_stage(item.id) {
                        warn!(worker = %name, item = %item.id, error = %e, "failed to advance item");
                    }
                }
                Err(trouble) => {
                    if let Err(e) = queue.set_trouble(item.id, trouble) {
                        warn!(worker = %name, item = %item.id, error = %e, "failed to park item");
                    }
                }
            }

            if shutting_down {
                break;
            }
        }
        debug!(worker = %name, "worker stopped");
    })
}
