//! The transcode commander.
//!
//! Owns the set of live [`TranscodeTask`]s: plans targets for items
//! reaching the transcode stage, admits tasks into a bounded pool of
//! encoder slots, supervises each running encoder, and aggregates per-item
//! completion. The commander learns about ready items from queue events
//! and announces its own outcomes on a separate event channel; it never
//! calls back into the services that feed it.

mod runner;
mod task;

pub use runner::{
    EncodeJob, EncodeProgress, FfmpegRunner, RunnerCommand, RunnerConfig, RunnerError,
    RunnerExit, RunnerHandle, TranscoderRunner,
};
pub use task::{TaskId, TaskStatus, TranscodeTask};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::QueueEvent;
use crate::queue::{ItemId, Queue, QueueError, Stage, Status, Trouble};
use crate::workflow::{FfmpegOptions, Target, WorkflowSet};

/// Commander configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommanderConfig {
    /// Process-wide cap on live encoders.
    pub max_concurrent_encoders: usize,
    /// Per-item cap on live encoders; 0 disables the cap.
    #[serde(default)]
    pub max_per_item_encoders: usize,
    /// Retained encoder log lines per task, oldest dropped first.
    #[serde(default = "default_log_ring")]
    pub log_ring_capacity: usize,
    /// Grace window for encoder cancellation at shutdown, in seconds.
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_log_ring() -> usize {
    100
}

fn default_grace_secs() -> u64 {
    15
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_encoders: 2,
            max_per_item_encoders: 0,
            log_ring_capacity: default_log_ring(),
            shutdown_grace_secs: default_grace_secs(),
        }
    }
}

impl CommanderConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Commander outcomes, consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum CommanderEvent {
    /// A task changed status or progress.
    TaskUpdated { task: TranscodeTask },
    /// Every task for the item is terminal and at least one completed.
    ItemCompleted { item_id: ItemId },
    /// Every task for the item is terminal and none completed.
    ItemFailed { item_id: ItemId },
    /// The item was released to `Cancelled` after its tasks wound down.
    ItemCancelled { item_id: ItemId },
}

/// Commander operation failures.
#[derive(Debug, Error)]
pub enum CommanderError {
    #[error("no transcode task with id {0}")]
    TaskNotFound(TaskId),

    #[error("no item with id {0}")]
    ItemNotFound(ItemId),

    #[error("task {id} is {status:?}; operation not applicable")]
    InvalidTaskState { id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Aggregate commander state for status snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommanderStatus {
    pub queued: usize,
    pub running: usize,
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct TaskEntry {
    task: TranscodeTask,
    input: PathBuf,
    options: FfmpegOptions,
    control: Option<mpsc::Sender<RunnerCommand>>,
    log_ring: Arc<StdMutex<VecDeque<String>>>,
}

enum CommanderMsg {
    /// Re-run the admission pass.
    Wake,
}

/// Schedules and supervises transcode tasks.
pub struct TranscodeCommander {
    config: CommanderConfig,
    runner: Arc<dyn TranscoderRunner>,
    queue: Arc<Queue>,
    workflows: Arc<WorkflowSet>,
    output_root: PathBuf,
    /// Fallback target for items matching no workflow.
    default_target: Target,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
    /// Slot-admission decisions serialize here; task-local updates do not.
    admission: Mutex<()>,
    next_task_id: AtomicU64,
    msg_tx: mpsc::Sender<CommanderMsg>,
    msg_rx: StdMutex<Option<mpsc::Receiver<CommanderMsg>>>,
    /// Subscribed at construction so no stage change is missed before the
    /// loop starts.
    queue_events: StdMutex<Option<broadcast::Receiver<QueueEvent>>>,
    events: broadcast::Sender<CommanderEvent>,
}

impl TranscodeCommander {
    pub fn new(
        config: CommanderConfig,
        runner: Arc<dyn TranscoderRunner>,
        queue: Arc<Queue>,
        workflows: Arc<WorkflowSet>,
        output_root: PathBuf,
        default_target: Target,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);
        let queue_events = queue.subscribe();
        Self {
            config,
            runner,
            queue,
            workflows,
            output_root,
            default_target,
            tasks: RwLock::new(HashMap::new()),
            admission: Mutex::new(()),
            next_task_id: AtomicU64::new(0),
            msg_tx,
            msg_rx: StdMutex::new(Some(msg_rx)),
            queue_events: StdMutex::new(Some(queue_events)),
            events,
        }
    }

    /// Subscribe to commander events.
    pub fn subscribe(&self) -> broadcast::Receiver<CommanderEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CommanderEvent) {
        let _ = self.events.send(event);
    }

    fn wake(&self) {
        // Coalescing is fine; a full channel already guarantees a pass.
        let _ = self.msg_tx.try_send(CommanderMsg::Wake);
    }

    /// The commander loop. Runs until the shutdown channel fires, then
    /// cancels all live encoders within the grace window.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let (msg_rx, queue_events) = {
            let msg_rx = self.msg_rx.lock().unwrap().take();
            let queue_events = self.queue_events.lock().unwrap().take();
            (msg_rx, queue_events)
        };
        let (Some(mut msg_rx), Some(mut queue_events)) = (msg_rx, queue_events) else {
            warn!("transcode commander started twice; ignoring");
            return;
        };

        info!("transcode commander started");
        // Items already waiting at the transcode stage (e.g. after restart).
        self.resync().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("transcode commander received shutdown signal");
                    self.cancel_all(self.config.shutdown_grace()).await;
                    break;
                }
                Some(CommanderMsg::Wake) = msg_rx.recv() => {
                    self.schedule().await;
                }
                event = queue_events.recv() => match event {
                    Ok(QueueEvent::StageChanged { id, stage: Stage::Transcode }) => {
                        self.plan_item(id).await;
                        self.schedule().await;
                    }
                    Ok(QueueEvent::QueueChanged) => self.schedule().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "commander lagged on queue events; resyncing");
                        self.resync().await;
                        self.schedule().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        info!("transcode commander stopped");
    }

    /// Pick up any pending transcode-stage items the event stream missed.
    async fn resync(self: &Arc<Self>) {
        let pending: Vec<ItemId> = self
            .queue
            .items()
            .into_iter()
            .filter(|i| i.stage == Stage::Transcode && i.status == Status::Pending)
            .map(|i| i.id)
            .collect();
        for id in pending {
            self.plan_item(id).await;
        }
    }

    /// Consult the workflow matcher and create this item's tasks.
    async fn plan_item(self: &Arc<Self>, item_id: ItemId) {
        let Some((item, _)) = self.queue.find(item_id) else {
            return;
        };
        if item.status != Status::Pending || item.stage != Stage::Transcode {
            return;
        }
        // Claim the item for the whole transcode phase.
        if let Err(e) = self.queue.set_status(item_id, Status::Processing) {
            warn!(item = %item_id, error = %e, "could not claim item for transcode");
            return;
        }

        let mut targets = self.workflows.targets_for(&item);
        if targets.is_empty() {
            // Every item produces at least one output.
            targets.push(self.default_target.clone());
        }

        let created = self.create_tasks(item_id, &item.path, &targets).await;
        info!(item = %item_id, tasks = created.len(), "planned transcode tasks");
    }

    /// Create `Queued` tasks for the item against explicit target ids.
    pub async fn submit(
        &self,
        item_id: ItemId,
        target_ids: &[Uuid],
    ) -> Result<Vec<TaskId>, CommanderError> {
        let (item, _) = self
            .queue
            .find(item_id)
            .ok_or(CommanderError::ItemNotFound(item_id))?;
        let targets: Vec<Target> = target_ids
            .iter()
            .filter_map(|id| self.workflows.target(*id))
            .collect();
        let created = self.create_tasks(item_id, &item.path, &targets).await;
        self.wake();
        Ok(created)
    }

    async fn create_tasks(
        &self,
        item_id: ItemId,
        input: &std::path::Path,
        targets: &[Target],
    ) -> Vec<TaskId> {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());

        let mut created = Vec::new();
        let mut tasks = self.tasks.write().await;
        for target in targets {
            // At most one non-terminal task per (item, target) pair.
            let duplicate = tasks.values().any(|e| {
                e.task.item_id == item_id
                    && e.task.target_id == target.id
                    && !e.task.status.is_terminal()
            });
            if duplicate {
                continue;
            }

            let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1);
            let output_path = self
                .output_root
                .join(format!("{}-{}.{}", stem, target.label, target.options.container));
            let task = TranscodeTask {
                id,
                item_id,
                target_id: target.id,
                target_label: target.label.clone(),
                output_path,
                status: TaskStatus::Queued,
                progress: 0.0,
                error: None,
            };
            let snapshot = task.clone();
            tasks.insert(
                id,
                TaskEntry {
                    task,
                    input: input.to_path_buf(),
                    options: target.options.clone(),
                    control: None,
                    log_ring: Arc::new(StdMutex::new(VecDeque::new())),
                },
            );
            created.push(id);
            self.emit(CommanderEvent::TaskUpdated { task: snapshot });
        }
        created
    }

    /// One admission pass: start queued tasks while slots are free.
    async fn schedule(self: &Arc<Self>) {
        let _admission = self.admission.lock().await;
        loop {
            let next = {
                let tasks = self.tasks.read().await;
                let live = tasks.values().filter(|e| e.task.status.is_live()).count();
                if live >= self.config.max_concurrent_encoders {
                    None
                } else {
                    let mut eligible: Vec<&TaskEntry> = tasks
                        .values()
                        .filter(|e| e.task.status == TaskStatus::Queued)
                        .filter(|e| {
                            // Paused or cancelling items do not start new work.
                            matches!(
                                self.queue.find(e.task.item_id),
                                Some((item, _)) if item.status == Status::Processing
                            )
                        })
                        .filter(|e| {
                            self.config.max_per_item_encoders == 0
                                || tasks
                                    .values()
                                    .filter(|o| {
                                        o.task.item_id == e.task.item_id
                                            && o.task.status.is_live()
                                    })
                                    .count()
                                    < self.config.max_per_item_encoders
                        })
                        .collect();

                    // Promoted items (queue position 0) encode first, then
                    // FIFO submission order.
                    eligible.sort_by_key(|e| {
                        let promoted = self.queue.position(e.task.item_id) == Some(0);
                        (if promoted { 0u8 } else { 1u8 }, e.task.id.0)
                    });
                    eligible.first().map(|e| e.task.id)
                }
            };

            let Some(task_id) = next else { break };
            self.launch(task_id).await;
        }
    }

    /// Start the encoder for one queued task and attach a supervisor.
    async fn launch(self: &Arc<Self>, task_id: TaskId) {
        let (job, ring, snapshot) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(&task_id) else {
                return;
            };
            entry.task.status = TaskStatus::Running;
            entry.task.progress = 0.0;
            (
                EncodeJob {
                    input: entry.input.clone(),
                    output: entry.task.output_path.clone(),
                    options: entry.options.clone(),
                },
                Arc::clone(&entry.log_ring),
                entry.task.clone(),
            )
        };
        self.emit(CommanderEvent::TaskUpdated { task: snapshot });
        debug!(task = %task_id, "launching encoder");

        match self.runner.start(job).await {
            Ok(handle) => {
                {
                    let mut tasks = self.tasks.write().await;
                    if let Some(entry) = tasks.get_mut(&task_id) {
                        entry.control = Some(handle.control());
                    }
                }
                self.spawn_supervisor(task_id, handle, ring);
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "failed to start encoder");
                self.on_task_finished(
                    task_id,
                    RunnerExit::Failed { code: None },
                    vec![e.to_string()],
                )
                .await;
            }
        }
    }

    /// One supervisor per running encoder: drains progress into the task
    /// record, keeps the bounded log ring, and reports the exit.
    fn spawn_supervisor(
        self: &Arc<Self>,
        task_id: TaskId,
        handle: RunnerHandle,
        ring: Arc<StdMutex<VecDeque<String>>>,
    ) {
        let this = Arc::clone(self);
        let ring_capacity = self.config.log_ring_capacity;
        tokio::spawn(async move {
            let RunnerHandle {
                mut progress,
                mut logs,
                mut done,
                ..
            } = handle;

            let exit = loop {
                tokio::select! {
                    Some(sample) = progress.recv() => {
                        let snapshot = {
                            let mut tasks = this.tasks.write().await;
                            tasks.get_mut(&task_id).map(|entry| {
                                entry.task.progress = sample.fraction;
                                entry.task.clone()
                            })
                        };
                        if let Some(task) = snapshot {
                            this.emit(CommanderEvent::TaskUpdated { task });
                        }
                    }
                    Some(line) = logs.recv() => {
                        let mut ring = ring.lock().unwrap();
                        if ring.len() >= ring_capacity {
                            ring.pop_front();
                        }
                        ring.push_back(line);
                    }
                    exit = &mut done => {
                        break exit.unwrap_or(RunnerExit::Failed { code: None });
                    }
                }
            };

            let log_tail: Vec<String> = ring.lock().unwrap().iter().cloned().collect();
            this.on_task_finished(task_id, exit, log_tail).await;
            this.wake();
        });
    }

    /// Apply a terminal runner exit to the task and aggregate the item.
    async fn on_task_finished(
        self: &Arc<Self>,
        task_id: TaskId,
        exit: RunnerExit,
        log_tail: Vec<String>,
    ) {
        let (item_id, snapshot, remove_output) = {
            let mut tasks = self.tasks.write().await;
            let Some(entry) = tasks.get_mut(&task_id) else {
                return;
            };
            entry.control = None;
            let remove_output = match &exit {
                RunnerExit::Completed => {
                    entry.task.status = TaskStatus::Complete;
                    entry.task.progress = 1.0;
                    false
                }
                RunnerExit::Cancelled => {
                    entry.task.status = TaskStatus::Cancelled;
                    true
                }
                RunnerExit::Failed { code } => {
                    entry.task.status = TaskStatus::Failed;
                    let mut detail = match code {
                        Some(code) => format!("encoder exited with code {code}"),
                        None => "encoder failed to run".to_string(),
                    };
                    if !log_tail.is_empty() {
                        detail.push_str(": ");
                        detail.push_str(&log_tail.join(" | "));
                    }
                    entry.task.error = Some(detail);
                    false
                }
            };
            (entry.task.item_id, entry.task.clone(), remove_output)
        };

        if remove_output {
            // Partial outputs of cancelled encodes are not kept.
            let _ = tokio::fs::remove_file(&snapshot.output_path).await;
        }

        info!(task = %task_id, status = ?snapshot.status, "transcode task finished");
        self.emit(CommanderEvent::TaskUpdated { task: snapshot });
        self.finalize_item(item_id).await;
    }

    /// When every task of an item is terminal, decide the item's fate.
    async fn finalize_item(self: &Arc<Self>, item_id: ItemId) {
        let item_tasks = self.instances_for_item(item_id).await;
        if item_tasks.is_empty() || item_tasks.iter().any(|t| !t.status.is_terminal()) {
            return;
        }

        let Some((item, _)) = self.queue.find(item_id) else {
            return;
        };
        if item.status.is_terminal() {
            return;
        }

        if item.status == Status::Cancelling {
            // Release the cancelled item now that its encoders are gone.
            if let Err(e) = self.queue.advance_stage(item_id) {
                warn!(item = %item_id, error = %e, "failed to release cancelled item");
            }
            self.emit(CommanderEvent::ItemCancelled { item_id });
            return;
        }

        let any_complete = item_tasks.iter().any(|t| t.status == TaskStatus::Complete);
        if any_complete {
            self.emit(CommanderEvent::ItemCompleted { item_id });
        } else {
            let detail = item_tasks
                .iter()
                .filter_map(|t| t.error.clone())
                .collect::<Vec<_>>()
                .join("; ");
            let trouble = Trouble::TranscodeFailed {
                target_label: item_tasks
                    .first()
                    .map(|t| t.target_label.clone())
                    .unwrap_or_default(),
                detail,
            };
            if let Err(e) = self.queue.set_trouble(item_id, trouble) {
                warn!(item = %item_id, error = %e, "failed to park failed item");
            }
            self.emit(CommanderEvent::ItemFailed { item_id });
        }
    }

    /// Snapshot of all tasks for an item.
    pub async fn instances_for_item(&self, item_id: ItemId) -> Vec<TranscodeTask> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<TranscodeTask> = tasks
            .values()
            .filter(|e| e.task.item_id == item_id)
            .map(|e| e.task.clone())
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    /// Snapshot of one task.
    pub async fn task(&self, task_id: TaskId) -> Option<TranscodeTask> {
        self.tasks.read().await.get(&task_id).map(|e| e.task.clone())
    }

    /// Recent encoder log lines for a task.
    pub async fn task_log(&self, task_id: TaskId) -> Vec<String> {
        match self.tasks.read().await.get(&task_id) {
            Some(entry) => entry.log_ring.lock().unwrap().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Aggregate counts for status snapshots.
    pub async fn status(&self) -> CommanderStatus {
        let tasks = self.tasks.read().await;
        let mut status = CommanderStatus::default();
        for entry in tasks.values() {
            match entry.task.status {
                TaskStatus::Queued => status.queued += 1,
                TaskStatus::Running => status.running += 1,
                TaskStatus::Suspended => status.suspended += 1,
                TaskStatus::Complete => status.completed += 1,
                TaskStatus::Failed => status.failed += 1,
                TaskStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Pause one running task.
    pub async fn pause_task(&self, task_id: TaskId) -> Result<(), CommanderError> {
        self.control_task(task_id, RunnerCommand::Pause, TaskStatus::Running, TaskStatus::Suspended)
            .await
    }

    /// Resume one suspended task.
    pub async fn resume_task(&self, task_id: TaskId) -> Result<(), CommanderError> {
        self.control_task(task_id, RunnerCommand::Resume, TaskStatus::Suspended, TaskStatus::Running)
            .await
    }

    async fn control_task(
        &self,
        task_id: TaskId,
        command: RunnerCommand,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<(), CommanderError> {
        let (control, snapshot) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(CommanderError::TaskNotFound(task_id))?;
            if entry.task.status != expected {
                return Err(CommanderError::InvalidTaskState {
                    id: task_id,
                    status: entry.task.status,
                });
            }
            entry.task.status = next;
            (entry.control.clone(), entry.task.clone())
        };
        if let Some(control) = control {
            let _ = control.send(command).await;
        }
        self.emit(CommanderEvent::TaskUpdated { task: snapshot });
        Ok(())
    }

    /// Cancel one task. Queued tasks cancel immediately; live ones are
    /// signalled and report back through their supervisor.
    pub async fn cancel_task(self: &Arc<Self>, task_id: TaskId) -> Result<(), CommanderError> {
        let action = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(CommanderError::TaskNotFound(task_id))?;
            match entry.task.status {
                TaskStatus::Queued => {
                    entry.task.status = TaskStatus::Cancelled;
                    CancelAction::Done(entry.task.clone())
                }
                TaskStatus::Running | TaskStatus::Suspended => {
                    CancelAction::Signal(entry.control.clone())
                }
                status => {
                    return Err(CommanderError::InvalidTaskState {
                        id: task_id,
                        status,
                    })
                }
            }
        };

        match action {
            CancelAction::Done(snapshot) => {
                let item_id = snapshot.item_id;
                self.emit(CommanderEvent::TaskUpdated { task: snapshot });
                self.finalize_item(item_id).await;
            }
            CancelAction::Signal(control) => {
                if let Some(control) = control {
                    let _ = control.send(RunnerCommand::Cancel).await;
                }
            }
        }
        Ok(())
    }

    /// Pause every live task of an item. The item-level pause is
    /// unconditional: all encoders stop, regardless of their mix of states.
    pub async fn pause_for_item(&self, item_id: ItemId) {
        for task in self.instances_for_item(item_id).await {
            if task.status == TaskStatus::Running {
                let _ = self.pause_task(task.id).await;
            }
        }
    }

    /// Resume every suspended task of an item.
    pub async fn resume_for_item(&self, item_id: ItemId) {
        for task in self.instances_for_item(item_id).await {
            if task.status == TaskStatus::Suspended {
                let _ = self.resume_task(task.id).await;
            }
        }
    }

    /// Cancel every non-terminal task of an item.
    pub async fn cancel_for_item(self: &Arc<Self>, item_id: ItemId) {
        for task in self.instances_for_item(item_id).await {
            if !task.status.is_terminal() {
                let _ = self.cancel_task(task.id).await;
            }
        }
    }

    /// Cancel everything and wait (bounded) for encoders to wind down.
    pub async fn cancel_all(self: &Arc<Self>, grace: Duration) {
        let live: Vec<TaskId> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|e| !e.task.status.is_terminal())
                .map(|e| e.task.id)
                .collect()
        };
        if live.is_empty() {
            return;
        }
        info!(count = live.len(), "cancelling all transcode tasks");
        for id in live {
            let _ = self.cancel_task(id).await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let remaining = {
                let tasks = self.tasks.read().await;
                tasks
                    .values()
                    .filter(|e| !e.task.status.is_terminal())
                    .count()
            };
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "encoders still live after shutdown grace");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

enum CancelAction {
    Done(TranscodeTask),
    Signal(Option<mpsc::Sender<RunnerCommand>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CommanderConfig::default();
        assert_eq!(config.max_concurrent_encoders, 2);
        assert_eq!(config.max_per_item_encoders, 0);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(15));
    }

    #[test]
    fn test_status_default_is_zeroed() {
        let status = CommanderStatus::default();
        assert_eq!(status.queued, 0);
        assert_eq!(status.running, 0);
    }
}
