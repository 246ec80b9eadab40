//! Top-level orchestration.
//!
//! Wires the queue, worker pool, ingestor and transcode commander
//! together, owns the shutdown channel, and drives the periodic ingest and
//! status ticks. External surfaces (an API layer, a UI) talk to the
//! pipeline exclusively through the service methods here.

mod types;

pub use types::{OrchestratorConfig, OrchestratorError, StageCounts, StatusSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::{Clock, Filesystem};
use crate::events::QueueEvent;
use crate::ingest::Ingestor;
use crate::metadata::MetadataFetcher;
use crate::queue::{CancelOutcome, Item, ItemId, Queue, Stage, TroubleResolution};
use crate::store::{MediaStore, OutputRecord};
use crate::tasks::{MetadataTask, PersistTask, TitleTask};
use crate::transcode::{
    CommanderEvent, TaskId, TaskStatus, TranscodeCommander, TranscodeTask, TranscoderRunner,
};
use crate::workers::{StageTask, WorkerPool};
use crate::workflow::{FfmpegOptions, Target, WorkflowSet};

/// Receives a status snapshot on every update tick.
pub type StatusCallback = Arc<dyn Fn(StatusSnapshot) + Send + Sync>;

/// The pipeline orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<Queue>,
    workflows: Arc<WorkflowSet>,
    store: Arc<dyn MediaStore>,
    fetcher: Arc<dyn MetadataFetcher>,
    runner: Arc<dyn TranscoderRunner>,
    commander: Arc<TranscodeCommander>,
    pool: Arc<WorkerPool>,
    ingestor: Arc<Ingestor>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    status_callback: StdMutex<Option<StatusCallback>>,
}

impl Orchestrator {
    /// Wire up the pipeline. Nothing starts until [`Orchestrator::start`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<Queue>,
        workflows: Arc<WorkflowSet>,
        store: Arc<dyn MediaStore>,
        fetcher: Arc<dyn MetadataFetcher>,
        runner: Arc<dyn TranscoderRunner>,
        fs: Arc<dyn Filesystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(4);

        let default_target = Target::new(
            "default",
            FfmpegOptions::remux(config.default_container.clone()),
        );
        let commander = Arc::new(TranscodeCommander::new(
            config.commander.clone(),
            Arc::clone(&runner),
            Arc::clone(&queue),
            Arc::clone(&workflows),
            config.output_path.clone(),
            default_target,
        ));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue), shutdown.clone()));
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&queue),
            fs,
            clock,
            Arc::clone(&commander),
            config.import_path.clone(),
        ));

        Self {
            config,
            queue,
            workflows,
            store,
            fetcher,
            runner,
            commander,
            pool,
            ingestor,
            shutdown,
            running: AtomicBool::new(false),
            handles: StdMutex::new(Vec::new()),
            status_callback: StdMutex::new(None),
        }
    }

    /// Install the status-snapshot receiver (e.g. a WebSocket fan-out).
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.lock().unwrap() = Some(callback);
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn workflows(&self) -> &Arc<WorkflowSet> {
        &self.workflows
    }

    pub fn commander(&self) -> &Arc<TranscodeCommander> {
        &self.commander
    }

    /// Start the pipeline: validate adapters, load persisted workflows,
    /// then bring up the commander, the workers and the tickers.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already running");
            return Ok(());
        }

        info!("starting orchestrator");

        // A missing encoder binary is unrecoverable at startup.
        self.runner
            .validate()
            .await
            .map_err(|e| OrchestratorError::Startup(e.to_string()))?;
        self.store.ensure_schema().await?;
        self.load_workflows().await;

        let mut handles = self.handles.lock().unwrap();

        // Commander first, so no stage transition is missed.
        handles.push(tokio::spawn(
            Arc::clone(&self.commander).run(self.shutdown.subscribe()),
        ));

        self.pool.spawn_workers(
            self.config.title_workers,
            Arc::new(TitleTask::new(Arc::clone(&self.queue))) as Arc<dyn StageTask>,
        );
        self.pool.spawn_workers(
            self.config.metadata_workers,
            Arc::new(MetadataTask::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.fetcher),
            )) as Arc<dyn StageTask>,
        );
        self.pool.spawn_workers(
            self.config.persist_workers,
            Arc::new(PersistTask::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
            )) as Arc<dyn StageTask>,
        );

        handles.push(self.spawn_event_loop());
        handles.push(self.spawn_ingest_ticker());
        handles.push(self.spawn_update_ticker());

        info!("orchestrator started");
        Ok(())
    }

    /// Graceful, bounded shutdown: stop ticking, stop picking, cancel
    /// encoders within the grace window, then join everything.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orchestrator");

        let _ = self.shutdown.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        let grace = self.config.commander.shutdown_grace() + Duration::from_secs(5);
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "orchestrator task panicked"),
                Err(_) => warn!("orchestrator task did not stop within grace window"),
            }
        }
        self.pool.close().await;

        info!("orchestrator stopped");
    }

    async fn load_workflows(&self) {
        match self.store.list_targets().await {
            Ok(targets) => {
                for target in targets {
                    if let Err(e) = self.workflows.insert_target(target) {
                        debug!(error = %e, "skipping persisted target");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load persisted targets"),
        }
        match self.store.list_workflows().await {
            Ok(workflows) => {
                for workflow in workflows {
                    if let Err(e) = self.workflows.insert_workflow(workflow) {
                        warn!(error = %e, "skipping persisted workflow");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load persisted workflows"),
        }
    }

    /// Reacts to queue and commander events: wakes the right workers and
    /// finalizes completed transcodes.
    fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut queue_events = self.queue.subscribe();
        let mut commander_events = self.commander.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = queue_events.recv() => match event {
                        Ok(QueueEvent::StageChanged { stage, .. }) => {
                            this.pool.wakeup_stage(stage);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            this.pool.wakeup_all();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = commander_events.recv() => match event {
                        Ok(CommanderEvent::ItemCompleted { item_id }) => {
                            let this = Arc::clone(&this);
                            tokio::spawn(async move {
                                this.finish_item(item_id).await;
                            });
                        }
                        Ok(CommanderEvent::ItemFailed { item_id }) => {
                            warn!(item = %item_id, "all transcode tasks failed");
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("event loop stopped");
        })
    }

    /// Record the completed item's outputs and mark it completed.
    async fn finish_item(&self, item_id: ItemId) {
        let Some((item, _)) = self.queue.find(item_id) else {
            return;
        };

        let outputs: Vec<OutputRecord> = self
            .commander
            .instances_for_item(item_id)
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| OutputRecord {
                target_label: t.target_label,
                output_path: t.output_path,
            })
            .collect();

        if let Some(media_id) = item.media_id {
            if let Err(e) = self.store.record_outputs(media_id, &outputs).await {
                error!(item = %item_id, error = %e, "failed to record transcode outputs");
                let _ = self.queue.set_trouble(
                    item_id,
                    crate::queue::Trouble::PersistFailed {
                        detail: format!("failed to record outputs: {e}"),
                    },
                );
                return;
            }
        } else {
            warn!(item = %item_id, "item completed without persisted media identity");
        }

        if let Err(e) = self.queue.advance_stage(item_id) {
            warn!(item = %item_id, error = %e, "failed to complete item");
        }
    }

    fn spawn_ingest_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.ingest_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match this.ingestor.tick().await {
                            Ok(summary) => {
                                if summary.admitted > 0 || summary.released > 0 {
                                    this.pool.wakeup_stage(Stage::Title);
                                }
                            }
                            Err(e) => warn!(error = %e, "ingest tick failed"),
                        }
                    }
                }
            }
            debug!("ingest ticker stopped");
        })
    }

    fn spawn_update_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.update_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let callback = this.status_callback.lock().unwrap().clone();
                        if let Some(callback) = callback {
                            callback(this.status().await);
                        }
                    }
                }
            }
            debug!("update ticker stopped");
        })
    }

    /// Aggregate pipeline status.
    pub async fn status(&self) -> StatusSnapshot {
        let items = self.queue.items();
        let mut stages = StageCounts::default();
        let mut troubled = 0;
        for item in &items {
            match item.stage {
                Stage::Import => stages.import += 1,
                Stage::Title => stages.title += 1,
                Stage::Metadata => stages.metadata += 1,
                Stage::Persist => stages.persist += 1,
                Stage::Transcode => stages.transcode += 1,
                Stage::Completed => stages.completed += 1,
            }
            if item.trouble.is_some() {
                troubled += 1;
            }
        }

        StatusSnapshot {
            running: self.running.load(Ordering::Relaxed),
            queue_length: items.len(),
            stages,
            troubled,
            commander: self.commander.status().await,
            workers: self.pool.worker_count(),
        }
    }

    // ------------------------------------------------------------------
    // Service methods: the surface an API layer would call.
    // ------------------------------------------------------------------

    pub fn items(&self) -> Vec<Item> {
        self.queue.items()
    }

    pub fn item(&self, id: ItemId) -> Result<Item, OrchestratorError> {
        self.queue
            .find(id)
            .map(|(item, _)| item)
            .ok_or(OrchestratorError::ItemNotFound(id))
    }

    pub fn reorder_queue(&self, order: &[ItemId]) -> Result<(), OrchestratorError> {
        self.queue.reorder(order)?;
        Ok(())
    }

    pub fn promote_item(&self, id: ItemId) -> Result<(), OrchestratorError> {
        self.queue.promote(id)?;
        Ok(())
    }

    /// Cancel an item and all of its encoders.
    pub async fn cancel_item(&self, id: ItemId) -> Result<CancelOutcome, OrchestratorError> {
        let outcome = self.queue.cancel(id)?;
        self.commander.cancel_for_item(id).await;
        Ok(outcome)
    }

    /// Pause an item and all of its running encoders, unconditionally.
    pub async fn pause_item(&self, id: ItemId) -> Result<(), OrchestratorError> {
        self.queue.pause(id)?;
        self.commander.pause_for_item(id).await;
        Ok(())
    }

    /// Resume a paused item and all of its suspended encoders.
    pub async fn resume_item(&self, id: ItemId) -> Result<(), OrchestratorError> {
        self.queue.resume(id)?;
        self.commander.resume_for_item(id).await;
        Ok(())
    }

    /// Resolve a parked item's trouble and wake the workers.
    pub fn resolve_trouble(
        &self,
        id: ItemId,
        resolution: TroubleResolution,
    ) -> Result<(), OrchestratorError> {
        self.queue.resolve_trouble(id, resolution)?;
        self.pool.wakeup_all();
        Ok(())
    }

    pub async fn transcode_tasks(&self, item_id: ItemId) -> Vec<TranscodeTask> {
        self.commander.instances_for_item(item_id).await
    }

    pub async fn pause_task(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        Ok(self.commander.pause_task(task_id).await?)
    }

    pub async fn resume_task(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        Ok(self.commander.resume_task(task_id).await?)
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        Ok(self.commander.cancel_task(task_id).await?)
    }
}
