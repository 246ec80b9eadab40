//! Transcode commander scheduling and supervision.
//!
//! Covers slot-bounded admission, promoted-item priority, item-level
//! cancellation with partial-output cleanup, pause/resume fan-out, and
//! failure aggregation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;

use thea_core::adapters::FileSnapshot;
use thea_core::queue::{ItemId, Queue, Stage, Status, Trouble};
use thea_core::testing::MockRunner;
use thea_core::transcode::{
    CommanderConfig, CommanderEvent, RunnerCommand, TaskStatus, TranscodeCommander,
};
use thea_core::workflow::{
    Criterion, FfmpegOptions, MatchField, MatchOperator, Target, Workflow, WorkflowSet,
};

struct Harness {
    queue: Arc<Queue>,
    workflows: Arc<WorkflowSet>,
    runner: Arc<MockRunner>,
    commander: Arc<TranscodeCommander>,
    shutdown: broadcast::Sender<()>,
    output_dir: PathBuf,
    _dir: TempDir,
}

impl Harness {
    fn new(config: CommanderConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let output_dir = dir.path().join("output");
        let queue = Arc::new(Queue::open(dir.path().join("cache")).unwrap());
        let workflows = Arc::new(WorkflowSet::new());
        let runner = Arc::new(MockRunner::new());
        let commander = Arc::new(TranscodeCommander::new(
            config,
            Arc::clone(&runner) as Arc<dyn thea_core::TranscoderRunner>,
            Arc::clone(&queue),
            Arc::clone(&workflows),
            output_dir.clone(),
            Target::new("default", FfmpegOptions::remux("mp4")),
        ));
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(Arc::clone(&commander).run(shutdown.subscribe()));

        Self {
            queue,
            workflows,
            runner,
            commander,
            shutdown,
            output_dir,
            _dir: dir,
        }
    }

    /// Admit an item and walk it to the transcode stage, which triggers
    /// the commander's planning.
    fn add_transcode_item(&self, path: &str) -> ItemId {
        let id = self
            .queue
            .push(
                PathBuf::from(path),
                FileSnapshot {
                    size_bytes: 1,
                    mod_time: Utc::now(),
                },
            )
            .unwrap();
        self.queue.advance_stage(id).unwrap();
        for stage in [Stage::Title, Stage::Metadata, Stage::Persist] {
            let picked = self.queue.pick(stage).unwrap();
            assert_eq!(picked.id, id);
            self.queue.advance_stage(id).unwrap();
        }
        id
    }

    async fn wait_for_item_status(&self, id: ItemId, status: Status) {
        for _ in 0..200 {
            if self.queue.find(id).map(|(i, _)| i.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "item {id} never reached {status:?}; currently {:?}",
            self.queue.find(id).map(|(i, _)| i.status)
        );
    }
}

#[tokio::test]
async fn item_reaching_transcode_gets_default_target() {
    let harness = Harness::new(CommanderConfig::default());
    let id = harness.add_transcode_item("/import/movie.2010.mkv");

    harness.runner.wait_for_started(1).await;
    let tasks = harness.commander.instances_for_item(id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].target_label, "default");
    assert_eq!(tasks[0].status, TaskStatus::Running);
    // The commander claimed the item for the transcode phase.
    assert_eq!(harness.queue.find(id).unwrap().0.status, Status::Processing);

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn matching_workflow_fans_out_one_task_per_target() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 8,
        ..CommanderConfig::default()
    });

    let hevc = Target::new("hevc", FfmpegOptions::remux("mkv"));
    let h264 = Target::new("h264", FfmpegOptions::remux("mp4"));
    let target_ids = vec![hevc.id, h264.id];
    harness.workflows.insert_target(hevc).unwrap();
    harness.workflows.insert_target(h264).unwrap();
    harness
        .workflows
        .insert_workflow(Workflow::new("everything", vec![], target_ids))
        .unwrap();

    let id = harness.add_transcode_item("/import/show.S01E01.mkv");
    harness.runner.wait_for_started(2).await;

    let tasks = harness.commander.instances_for_item(id).await;
    assert_eq!(tasks.len(), 2);
    let labels: Vec<&str> = tasks.iter().map(|t| t.target_label.as_str()).collect();
    assert!(labels.contains(&"hevc"));
    assert!(labels.contains(&"h264"));

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn slot_limit_bounds_live_encoders() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 1,
        ..CommanderConfig::default()
    });

    harness.add_transcode_item("/import/a.2001.mkv");
    harness.add_transcode_item("/import/b.2002.mkv");
    harness.runner.wait_for_started(1).await;

    // Give the scheduler a chance to (incorrectly) over-admit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.runner.started_count(), 1);
    let status = harness.commander.status().await;
    assert_eq!(status.running, 1);
    assert_eq!(status.queued, 1);

    // Completing the first frees the slot for the second.
    harness.runner.encoders()[0].complete();
    harness.runner.wait_for_started(2).await;

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn promoted_item_is_admitted_next() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 1,
        ..CommanderConfig::default()
    });

    let a = harness.add_transcode_item("/import/a.2001.mkv");
    harness.runner.wait_for_started(1).await;
    let _b = harness.add_transcode_item("/import/b.2002.mkv");
    let _c = harness.add_transcode_item("/import/c.2003.mkv");
    let d = harness.add_transcode_item("/import/d.2004.mkv");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.runner.started_count(), 1);

    // Queue is [a, b, c, d]; promoting d puts it at the front.
    harness.queue.promote(d).unwrap();
    let order: Vec<ItemId> = harness.queue.items().iter().map(|i| i.id).collect();
    assert_eq!(order[0], d);

    // When a's encoder finishes, d encodes next despite b and c having
    // been submitted earlier.
    harness.runner.encoders()[0].complete();
    harness.runner.wait_for_started(2).await;
    let second = &harness.runner.encoders()[1];
    assert_eq!(second.job.input, PathBuf::from("/import/d.2004.mkv"));

    // a completes as usual.
    let tasks = harness.commander.instances_for_item(a).await;
    assert_eq!(tasks[0].status, TaskStatus::Complete);

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn cancel_item_cancels_all_encoders_and_removes_partial_output() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 4,
        ..CommanderConfig::default()
    });

    let hevc = Target::new("hevc", FfmpegOptions::remux("mkv"));
    let h264 = Target::new("h264", FfmpegOptions::remux("mp4"));
    let target_ids = vec![hevc.id, h264.id];
    harness.workflows.insert_target(hevc).unwrap();
    harness.workflows.insert_target(h264).unwrap();
    harness
        .workflows
        .insert_workflow(Workflow::new("everything", vec![], target_ids))
        .unwrap();

    let id = harness.add_transcode_item("/import/cancel-me.S01E01.mkv");
    harness.runner.wait_for_started(2).await;

    // Simulate partial outputs on disk.
    std::fs::create_dir_all(&harness.output_dir).unwrap();
    for task in harness.commander.instances_for_item(id).await {
        std::fs::write(&task.output_path, b"partial").unwrap();
    }

    // Item-level cancel: queue first, then the commander's encoders.
    harness.queue.cancel(id).unwrap();
    harness.commander.cancel_for_item(id).await;

    harness.wait_for_item_status(id, Status::Cancelled).await;
    let tasks = harness.commander.instances_for_item(id).await;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
    for task in &tasks {
        assert!(
            !task.output_path.exists(),
            "partial output not removed: {}",
            task.output_path.display()
        );
    }
    for encoder in harness.runner.encoders() {
        assert!(encoder.commands().contains(&RunnerCommand::Cancel));
    }

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn pause_and_resume_fan_out_to_all_encoders() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 4,
        ..CommanderConfig::default()
    });

    let id = harness.add_transcode_item("/import/pausable.2015.mkv");
    harness.runner.wait_for_started(1).await;

    harness.queue.pause(id).unwrap();
    harness.commander.pause_for_item(id).await;

    let tasks = harness.commander.instances_for_item(id).await;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Suspended));
    assert_eq!(
        harness.runner.encoders()[0].commands(),
        vec![RunnerCommand::Pause]
    );

    harness.queue.resume(id).unwrap();
    harness.commander.resume_for_item(id).await;
    let tasks = harness.commander.instances_for_item(id).await;
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Running));
    assert_eq!(
        harness.runner.encoders()[0].commands(),
        vec![RunnerCommand::Pause, RunnerCommand::Resume]
    );

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn all_encoders_failing_parks_the_item() {
    let harness = Harness::new(CommanderConfig::default());
    let mut events = harness.commander.subscribe();

    let id = harness.add_transcode_item("/import/broken.2020.mkv");
    harness.runner.wait_for_started(1).await;

    harness.runner.encoders()[0].send_log("moov atom not found").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.runner.encoders()[0].fail(1);

    harness.wait_for_item_status(id, Status::NeedsAttention).await;
    let (item, _) = harness.queue.find(id).unwrap();
    match item.trouble {
        Some(Trouble::TranscodeFailed { detail, .. }) => {
            assert!(detail.contains("code 1"), "unexpected detail: {detail}");
            assert!(detail.contains("moov atom"), "stderr tail missing: {detail}");
        }
        other => panic!("expected transcode trouble, got {other:?}"),
    }

    // The failure was announced on the event channel.
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CommanderEvent::ItemFailed { item_id } if item_id == id) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn completion_emits_item_completed_event() {
    let harness = Harness::new(CommanderConfig::default());
    let mut events = harness.commander.subscribe();

    let id = harness.add_transcode_item("/import/fine.2020.mkv");
    harness.runner.wait_for_started(1).await;
    harness.runner.encoders()[0].send_progress(0.5).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let tasks = harness.commander.instances_for_item(id).await;
    assert!(tasks[0].progress > 0.0);

    harness.runner.encoders()[0].complete();

    let mut completed = false;
    for _ in 0..200 {
        match events.try_recv() {
            Ok(CommanderEvent::ItemCompleted { item_id }) if item_id == id => {
                completed = true;
                break;
            }
            Ok(_) => {}
            Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    assert!(completed);

    let tasks = harness.commander.instances_for_item(id).await;
    assert_eq!(tasks[0].status, TaskStatus::Complete);
    assert_eq!(tasks[0].progress, 1.0);

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn shutdown_cancels_every_live_encoder() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 4,
        shutdown_grace_secs: 5,
        ..CommanderConfig::default()
    });

    harness.add_transcode_item("/import/one.2001.mkv");
    harness.add_transcode_item("/import/two.2002.mkv");
    harness.runner.wait_for_started(2).await;

    harness
        .commander
        .cancel_all(Duration::from_secs(5))
        .await;

    // No orphans: every task reached a terminal status.
    let status = harness.commander.status().await;
    assert_eq!(status.running + status.suspended + status.queued, 0);
    assert_eq!(status.cancelled, 2);

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn per_item_fairness_cap_leaves_room_for_others() {
    let harness = Harness::new(CommanderConfig {
        max_concurrent_encoders: 2,
        max_per_item_encoders: 1,
        ..CommanderConfig::default()
    });

    let wide = Target::new("a", FfmpegOptions::remux("mkv"));
    let tall = Target::new("b", FfmpegOptions::remux("mp4"));
    let target_ids = vec![wide.id, tall.id];
    harness.workflows.insert_target(wide).unwrap();
    harness.workflows.insert_target(tall).unwrap();
    harness
        .workflows
        .insert_workflow(Workflow::new(
            "episodes",
            vec![Criterion::new(MatchField::Episodic, MatchOperator::Equals, "true").unwrap()],
            target_ids,
        ))
        .unwrap();

    // First item fans out to two targets but may only hold one slot.
    let first = harness.add_transcode_item("/import/wide.S01E01.mkv");
    harness.runner.wait_for_started(1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.runner.started_count(), 1);

    // A second item takes the remaining slot instead of starving.
    let second = harness.add_transcode_item("/import/other.2010.mkv");
    harness.runner.wait_for_started(2).await;
    let second_tasks = harness.commander.instances_for_item(second).await;
    assert_eq!(second_tasks[0].status, TaskStatus::Running);

    let first_tasks = harness.commander.instances_for_item(first).await;
    let running = first_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .count();
    assert_eq!(running, 1);

    let _ = harness.shutdown.send(());
}
