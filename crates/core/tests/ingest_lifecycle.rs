//! Ingestor behaviour against a scripted filesystem and manual clock.
//!
//! Covers the modtime stability gate, removed-source reconciliation, and
//! scan idempotence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use thea_core::adapters::Clock;
use thea_core::ingest::Ingestor;
use thea_core::queue::{Queue, Stage, Status};
use thea_core::testing::{ManualClock, MockFilesystem, MockRunner};
use thea_core::transcode::{CommanderConfig, TranscodeCommander};
use thea_core::workflow::{FfmpegOptions, Target, WorkflowSet};

struct Harness {
    queue: Arc<Queue>,
    fs: Arc<MockFilesystem>,
    clock: Arc<ManualClock>,
    ingestor: Ingestor,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(Queue::open(dir.path().join("cache")).unwrap());
        let fs = Arc::new(MockFilesystem::new());
        let clock = Arc::new(ManualClock::from_now());
        let runner = Arc::new(MockRunner::new());
        let commander = Arc::new(TranscodeCommander::new(
            CommanderConfig::default(),
            runner,
            Arc::clone(&queue),
            Arc::new(WorkflowSet::new()),
            dir.path().join("output"),
            Target::new("default", FfmpegOptions::remux("mp4")),
        ));
        let ingestor = Ingestor::new(
            Arc::clone(&queue),
            Arc::clone(&fs) as Arc<dyn thea_core::adapters::Filesystem>,
            Arc::clone(&clock) as Arc<dyn thea_core::adapters::Clock>,
            commander,
            PathBuf::from("/import"),
        );
        Self {
            queue,
            fs,
            clock,
            ingestor,
            _dir: dir,
        }
    }
}

#[tokio::test]
async fn stability_gate_holds_then_releases() {
    let harness = Harness::new();
    let now = harness.clock.now();
    harness.fs.add_file("/import/show.S01E02.mkv", 4096, now);

    // First tick (t=0): admitted, held at import.
    let summary = harness.ingestor.tick().await.unwrap();
    assert_eq!(summary.admitted, 1);
    assert_eq!(summary.released, 0);

    // t=60s: still inside the stability window.
    harness.clock.advance(Duration::from_secs(60));
    harness.ingestor.tick().await.unwrap();
    let item = &harness.queue.items()[0];
    assert_eq!(item.stage, Stage::Import);
    assert_eq!(item.status, Status::Pending);

    // t=125s: window passed, item released to the title stage.
    harness.clock.advance(Duration::from_secs(65));
    let summary = harness.ingestor.tick().await.unwrap();
    assert_eq!(summary.released, 1);
    let item = &harness.queue.items()[0];
    assert_eq!(item.stage, Stage::Title);
    assert_eq!(item.status, Status::Pending);
}

#[tokio::test]
async fn rewritten_file_stays_held() {
    let harness = Harness::new();
    let now = harness.clock.now();
    harness.fs.add_file("/import/still-copying.mkv", 4096, now);
    harness.ingestor.tick().await.unwrap();

    // The writer keeps touching the file; the gate must not release it.
    harness.clock.advance(Duration::from_secs(115));
    harness
        .fs
        .touch(Path::new("/import/still-copying.mkv"), harness.clock.now());
    harness.clock.advance(Duration::from_secs(60));
    let summary = harness.ingestor.tick().await.unwrap();

    assert_eq!(summary.released, 0);
    assert_eq!(harness.queue.items()[0].stage, Stage::Import);
}

#[tokio::test]
async fn removed_source_cancels_and_filters_item() {
    let harness = Harness::new();
    let now = harness.clock.now();
    harness.fs.add_file("/import/gone.mkv", 4096, now);
    harness.ingestor.tick().await.unwrap();
    let id = harness.queue.items()[0].id;

    // Walk the item to the metadata stage.
    harness.queue.advance_stage(id).unwrap();
    harness.queue.pick(Stage::Title).unwrap();
    harness.queue.advance_stage(id).unwrap();
    assert_eq!(harness.queue.items()[0].stage, Stage::Metadata);

    // Source disappears; the next tick cancels and removes the item.
    harness.fs.remove_file(Path::new("/import/gone.mkv"));
    let summary = harness.ingestor.tick().await.unwrap();
    assert_eq!(summary.removed, 1);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn back_to_back_scans_are_idempotent() {
    let harness = Harness::new();
    let now = harness.clock.now();
    harness.fs.add_file("/import/a.mkv", 1, now);
    harness.fs.add_file("/import/nested/b.mkv", 2, now);

    let first = harness.ingestor.tick().await.unwrap();
    assert_eq!(first.admitted, 2);

    let before = harness.queue.items();
    let second = harness.ingestor.tick().await.unwrap();
    assert_eq!(second.admitted, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.released, 0);
    assert_eq!(harness.queue.items(), before);
}

#[tokio::test]
async fn excluded_paths_are_not_readmitted() {
    let harness = Harness::new();
    let now = harness.clock.now();
    harness.fs.add_file("/import/done.mkv", 1, now);
    harness.ingestor.tick().await.unwrap();
    let id = harness.queue.items()[0].id;

    // Drive the item to completion; its path lands in the exclusion cache.
    harness.queue.advance_stage(id).unwrap();
    loop {
        let (item, _) = harness.queue.find(id).unwrap();
        if item.stage == Stage::Completed {
            break;
        }
        harness.queue.pick(item.stage).unwrap();
        harness.queue.advance_stage(id).unwrap();
    }
    harness.queue.filter(|i| !i.status.is_terminal());

    // The file is still on disk, but two more scans admit nothing.
    for _ in 0..2 {
        let summary = harness.ingestor.tick().await.unwrap();
        assert_eq!(summary.admitted, 0);
    }
    assert!(harness.queue.is_empty());
}
