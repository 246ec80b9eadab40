//! The processing queue.
//!
//! Ordered, de-duplicated collection of [`Item`]s. The queue exclusively
//! owns the item records; everything else reads snapshots and mutates
//! through the methods here, which serialize under a single short-held
//! lock (no I/O under the lock except the explicit exclusion-cache flush
//! on completion).

mod cache;
mod item;

pub use cache::ExclusionCache;
pub use item::{
    Item, ItemId, MetadataState, Stage, Status, TitleInfo, TitleState, Trouble,
};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::FileSnapshot;
use crate::events::{queue_channel, QueueEvent};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An item with this path is already queued.
    #[error("item with path {0} is already queued")]
    DuplicatePath(PathBuf),

    /// The path has already been processed (present in the exclusion cache).
    #[error("path {0} has already been processed")]
    PathExcluded(PathBuf),

    /// No item with the given id.
    #[error("no item with id {0}")]
    NotFound(ItemId),

    /// Reorder input was not a permutation of the current item ids.
    #[error("new order is not a permutation of the current queue")]
    InvalidPermutation,

    /// A status transition violated the state machine.
    #[error("illegal transition for item {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: ItemId,
        from: Status,
        to: Status,
    },

    /// The item has no trouble to resolve.
    #[error("item {0} has no trouble attached")]
    NoTrouble(ItemId),

    /// Exclusion cache I/O failure.
    #[error("exclusion cache error: {0}")]
    Cache(#[from] io::Error),
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was idle and is now `Cancelled`.
    Cancelled,
    /// The item was busy; it is now `Cancelling` and will become
    /// `Cancelled` when its current task releases it.
    Scheduled,
}

/// A resolution supplied for a parked item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TroubleResolution {
    /// Choose one of the metadata stubs offered by an ambiguous lookup.
    ChooseStub { stub_id: String },
    /// Clear the trouble and retry the stage as-is.
    Retry,
}

struct Inner {
    items: Vec<Item>,
    next_id: u64,
    cache: ExclusionCache,
}

/// The shared processing queue.
pub struct Queue {
    inner: Mutex<Inner>,
    events: broadcast::Sender<QueueEvent>,
}

impl Queue {
    /// Open a queue whose exclusion cache lives at `cache_path`.
    pub fn open(cache_path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let cache = ExclusionCache::open(cache_path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                next_id: 0,
                cache,
            }),
            events: queue_channel(),
        })
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // Nobody listening is fine (startup, tests).
        let _ = self.events.send(event);
    }

    /// Admit a new item. Fails if the path is already queued or excluded.
    pub fn push(&self, path: PathBuf, file: FileSnapshot) -> Result<ItemId, QueueError> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            if inner.items.iter().any(|i| i.path == path) {
                return Err(QueueError::DuplicatePath(path));
            }
            if inner.cache.contains(&path) {
                return Err(QueueError::PathExcluded(path));
            }
            inner.next_id += 1;
            let id = ItemId(inner.next_id);
            inner.items.push(Item::new(id, path, file));
            id
        };
        debug!(item = %id, "admitted new item");
        self.emit(QueueEvent::QueueChanged);
        Ok(id)
    }

    /// Snapshot of all items in queue order.
    pub fn items(&self) -> Vec<Item> {
        self.inner.lock().unwrap().items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// Find an item and its current queue position.
    pub fn find(&self, id: ItemId) -> Option<(Item, usize)> {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .iter()
            .position(|i| i.id == id)
            .map(|idx| (inner.items[idx].clone(), idx))
    }

    /// Current queue position of an item.
    pub fn position(&self, id: ItemId) -> Option<usize> {
        self.inner.lock().unwrap().items.iter().position(|i| i.id == id)
    }

    /// Claim the first `Pending` item at `stage` in queue order, flipping it
    /// to `Processing`. No two callers can receive the same item.
    pub fn pick(&self, stage: Stage) -> Option<Item> {
        let picked = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.stage == stage && i.status == Status::Pending)?;
            item.status = Status::Processing;
            item.clone()
        };
        debug!(item = %picked.id, stage = ?stage, "picked item");
        self.emit(QueueEvent::ItemUpdated { id: picked.id });
        Some(picked)
    }

    /// Advance an item to its next stage, returning the stage it entered.
    ///
    /// Legal from `Processing`, and from `Pending` while still at `Import`
    /// (the ingestor releases the import hold without claiming the item).
    /// An item whose status moved to `Cancelling` while it was processing is
    /// released to `Cancelled` instead of advancing.
    pub fn advance_stage(&self, id: ItemId) -> Result<Stage, QueueError> {
        let (event, entered, completed_path) = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;

            if item.status == Status::Cancelling {
                item.status = Status::Cancelled;
                info!(item = %id, "released cancelling item");
                (None, item.stage, None)
            } else {
                let legal = item.status == Status::Processing
                    || (item.stage == Stage::Import && item.status == Status::Pending);
                if !legal {
                    return Err(QueueError::IllegalTransition {
                        id,
                        from: item.status,
                        to: Status::Pending,
                    });
                }
                let next = item.stage.next().ok_or(QueueError::IllegalTransition {
                    id,
                    from: item.status,
                    to: Status::Completed,
                })?;

                item.stage = next;
                let completed = if next == Stage::Completed {
                    item.status = Status::Completed;
                    Some(item.path.clone())
                } else {
                    item.status = Status::Pending;
                    None
                };
                let event = QueueEvent::StageChanged {
                    id: item.id,
                    stage: next,
                };

                if let Some(path) = &completed {
                    // Completed paths are excluded from future admission.
                    inner.cache.record(path)?;
                }
                (Some(event), next, completed)
            }
        };

        if completed_path.is_some() {
            info!(item = %id, "item completed");
        } else {
            debug!(item = %id, stage = ?entered, "item advanced");
        }
        if let Some(event) = event {
            self.emit(event);
        }
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(entered)
    }

    /// Apply a validated status transition.
    pub fn set_status(&self, id: ItemId, to: Status) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;
            if !item.status.can_transition(to) {
                warn!(item = %id, from = ?item.status, to = ?to, "rejected status transition");
                return Err(QueueError::IllegalTransition {
                    id,
                    from: item.status,
                    to,
                });
            }
            item.status = to;
        }
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(())
    }

    /// Record a parsed title on an item.
    pub fn set_title(&self, id: ItemId, info: TitleInfo) -> Result<(), QueueError> {
        self.mutate(id, |item| item.title = TitleState::Parsed(info))
    }

    /// Record the metadata lookup state on an item.
    pub fn set_metadata(&self, id: ItemId, state: MetadataState) -> Result<(), QueueError> {
        self.mutate(id, |item| item.metadata = state)
    }

    /// Record the persisted media identity on an item.
    pub fn set_media_id(&self, id: ItemId, media_id: Uuid) -> Result<(), QueueError> {
        self.mutate(id, |item| item.media_id = Some(media_id))
    }

    fn mutate(
        &self,
        id: ItemId,
        f: impl FnOnce(&mut Item),
    ) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;
            f(item);
        }
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(())
    }

    /// Attach a trouble, parking the item in the trouble's status. An item
    /// already `Cancelling` is released to `Cancelled` instead; the trouble
    /// is discarded.
    pub fn set_trouble(&self, id: ItemId, trouble: Trouble) -> Result<Status, QueueError> {
        let parked = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;

            if item.status == Status::Cancelling {
                item.status = Status::Cancelled;
                Status::Cancelled
            } else {
                let to = trouble.parks_in();
                if !item.status.can_transition(to) {
                    return Err(QueueError::IllegalTransition {
                        id,
                        from: item.status,
                        to,
                    });
                }
                warn!(item = %id, trouble = ?trouble, "item parked with trouble");
                item.status = to;
                item.trouble = Some(trouble);
                to
            }
        };
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(parked)
    }

    /// Resolve a parked item's trouble, returning it to `Pending` at its
    /// current stage. Choosing a stub additionally pins the metadata lookup
    /// to that stub's id.
    pub fn resolve_trouble(
        &self,
        id: ItemId,
        resolution: TroubleResolution,
    ) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;

            if item.trouble.is_none() {
                return Err(QueueError::NoTrouble(id));
            }
            if !item.status.can_transition(Status::Pending) {
                return Err(QueueError::IllegalTransition {
                    id,
                    from: item.status,
                    to: Status::Pending,
                });
            }

            if let TroubleResolution::ChooseStub { stub_id } = resolution {
                item.metadata = MetadataState::Resolved { stub_id };
            }
            item.trouble = None;
            item.status = Status::Pending;
            info!(item = %id, "trouble resolved");
        }
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(())
    }

    /// Cancel an item. Idle items become `Cancelled` immediately; busy ones
    /// are marked `Cancelling` and release on task completion.
    pub fn cancel(&self, id: ItemId) -> Result<CancelOutcome, QueueError> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;

            match item.status {
                Status::Pending | Status::NeedsResolving => {
                    item.status = Status::Cancelled;
                    CancelOutcome::Cancelled
                }
                Status::Processing | Status::Paused | Status::NeedsAttention => {
                    item.status = Status::Cancelling;
                    CancelOutcome::Scheduled
                }
                from @ (Status::Cancelling | Status::Cancelled | Status::Completed) => {
                    return Err(QueueError::IllegalTransition {
                        id,
                        from,
                        to: Status::Cancelled,
                    });
                }
            }
        };
        info!(item = %id, outcome = ?outcome, "item cancellation requested");
        self.emit(QueueEvent::ItemUpdated { id });
        Ok(outcome)
    }

    /// Pause a processing item.
    pub fn pause(&self, id: ItemId) -> Result<(), QueueError> {
        self.set_status(id, Status::Paused)
    }

    /// Resume a paused item.
    pub fn resume(&self, id: ItemId) -> Result<(), QueueError> {
        self.set_status(id, Status::Processing)
    }

    /// Atomically apply a new ordering. `new_order` must be a permutation of
    /// the current item ids.
    pub fn reorder(&self, new_order: &[ItemId]) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if new_order.len() != inner.items.len() {
                return Err(QueueError::InvalidPermutation);
            }
            let unique: std::collections::HashSet<ItemId> =
                new_order.iter().copied().collect();
            if unique.len() != new_order.len() {
                return Err(QueueError::InvalidPermutation);
            }
            for id in new_order {
                if !inner.items.iter().any(|i| i.id == *id) {
                    return Err(QueueError::InvalidPermutation);
                }
            }

            // Validated as a permutation; the rebuild cannot fail.
            let mut reordered = Vec::with_capacity(inner.items.len());
            for id in new_order {
                if let Some(idx) = inner.items.iter().position(|i| i.id == *id) {
                    reordered.push(inner.items.remove(idx));
                }
            }
            inner.items = reordered;
        }
        self.emit(QueueEvent::QueueChanged);
        Ok(())
    }

    /// Move an item to the front of the queue, preserving the relative
    /// order of the rest.
    pub fn promote(&self, id: ItemId) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner
                .items
                .iter()
                .position(|i| i.id == id)
                .ok_or(QueueError::NotFound(id))?;
            if idx > 0 {
                let item = inner.items.remove(idx);
                inner.items.insert(0, item);
            }
        }
        info!(item = %id, "item promoted");
        self.emit(QueueEvent::QueueChanged);
        Ok(())
    }

    /// Keep items for which the predicate is true; return the removed ones.
    /// Callers are expected to have driven removed items to a terminal
    /// status first.
    pub fn filter(&self, keep: impl Fn(&Item) -> bool) -> Vec<Item> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = Vec::new();
            inner.items.retain(|item| {
                if keep(item) {
                    true
                } else {
                    removed.push(item.clone());
                    false
                }
            });
            removed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "items filtered out of queue");
            self.emit(QueueEvent::QueueChanged);
        }
        removed
    }

    /// Visit items over a snapshot, in queue order. The visitor returns
    /// `false` to stop early.
    pub fn for_each(&self, mut visitor: impl FnMut(usize, &Item) -> bool) {
        let snapshot = self.items();
        for (idx, item) in snapshot.iter().enumerate() {
            if !visitor(idx, item) {
                break;
            }
        }
    }

    /// Re-read the exclusion cache from disk.
    pub fn reload(&self) -> Result<(), QueueError> {
        self.inner.lock().unwrap().cache.reload()?;
        Ok(())
    }

    /// Whether a path is in the exclusion cache.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().cache.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot() -> FileSnapshot {
        FileSnapshot {
            size_bytes: 64,
            mod_time: Utc::now(),
        }
    }

    fn queue() -> (Queue, TempDir) {
        let dir = TempDir::new().unwrap();
        let q = Queue::open(dir.path().join("cache")).unwrap();
        (q, dir)
    }

    fn push(q: &Queue, path: &str) -> ItemId {
        q.push(PathBuf::from(path), snapshot()).unwrap()
    }

    #[test]
    fn test_push_rejects_duplicate_path() {
        let (q, _dir) = queue();
        push(&q, "/import/a.mkv");
        let err = q.push(PathBuf::from("/import/a.mkv"), snapshot()).unwrap_err();
        assert!(matches!(err, QueueError::DuplicatePath(_)));
    }

    #[test]
    fn test_pick_claims_each_item_once() {
        let (q, _dir) = queue();
        let a = push(&q, "/import/a.mkv");
        push(&q, "/import/b.mkv");

        let first = q.pick(Stage::Import).unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.status, Status::Processing);

        // Second pick skips the claimed item.
        let second = q.pick(Stage::Import).unwrap();
        assert_ne!(second.id, a);
        assert!(q.pick(Stage::Import).is_none());
    }

    #[test]
    fn test_advance_through_all_stages() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");

        // Import hold released without a claim.
        assert_eq!(q.advance_stage(id).unwrap(), Stage::Title);

        for expected in [Stage::Metadata, Stage::Persist, Stage::Transcode, Stage::Completed] {
            let picked = q.pick(expected.prev_for_test()).unwrap();
            assert_eq!(picked.id, id);
            assert_eq!(q.advance_stage(id).unwrap(), expected);
        }

        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.stage, Stage::Completed);
        assert_eq!(item.status, Status::Completed);
        assert!(q.is_excluded(Path::new("/import/a.mkv")));
    }

    #[test]
    fn test_advance_requires_processing() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");
        q.advance_stage(id).unwrap(); // Import -> Title (allowed from Pending)

        // Title -> Metadata needs a claim first.
        let err = q.advance_stage(id).unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { .. }));
    }

    #[test]
    fn test_completed_path_not_readmitted() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");
        q.advance_stage(id).unwrap();
        for _ in 0..4 {
            q.pick_any_for_test(id);
            q.advance_stage(id).unwrap();
        }
        q.filter(|i| !i.status.is_terminal());

        let err = q.push(PathBuf::from("/import/a.mkv"), snapshot()).unwrap_err();
        assert!(matches!(err, QueueError::PathExcluded(_)));
    }

    #[test]
    fn test_reorder_is_a_permutation() {
        let (q, _dir) = queue();
        let a = push(&q, "/import/a.mkv");
        let b = push(&q, "/import/b.mkv");
        let c = push(&q, "/import/c.mkv");

        q.reorder(&[c, a, b]).unwrap();
        let order: Vec<ItemId> = q.items().iter().map(|i| i.id).collect();
        assert_eq!(order, vec![c, a, b]);

        // Wrong length rejected.
        assert!(matches!(
            q.reorder(&[a, b]).unwrap_err(),
            QueueError::InvalidPermutation
        ));
        // Duplicate id rejected, queue unchanged.
        assert!(matches!(
            q.reorder(&[a, a, b]).unwrap_err(),
            QueueError::InvalidPermutation
        ));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_promote_moves_to_front() {
        let (q, _dir) = queue();
        let a = push(&q, "/import/a.mkv");
        let b = push(&q, "/import/b.mkv");
        let c = push(&q, "/import/c.mkv");
        let d = push(&q, "/import/d.mkv");

        q.promote(d).unwrap();
        let order: Vec<ItemId> = q.items().iter().map(|i| i.id).collect();
        assert_eq!(order, vec![d, a, b, c]);
    }

    #[test]
    fn test_pick_follows_queue_order_after_reorder() {
        let (q, _dir) = queue();
        let a = push(&q, "/import/a.mkv");
        let b = push(&q, "/import/b.mkv");

        q.reorder(&[b, a]).unwrap();
        assert_eq!(q.pick(Stage::Import).unwrap().id, b);
    }

    #[test]
    fn test_cancel_idle_item_is_immediate() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");
        assert_eq!(q.cancel(id).unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(
            q.cancel(id).unwrap_err(),
            QueueError::IllegalTransition { .. }
        ));
    }

    #[test]
    fn test_cancel_busy_item_is_scheduled_and_released() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");
        q.pick(Stage::Import).unwrap();

        assert_eq!(q.cancel(id).unwrap(), CancelOutcome::Scheduled);
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::Cancelling);

        // Task completion releases the item instead of advancing it.
        q.advance_stage(id).unwrap();
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::Cancelled);
        assert_eq!(item.stage, Stage::Import);
    }

    #[test]
    fn test_trouble_parks_and_resolution_unparks() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");
        q.advance_stage(id).unwrap();
        q.advance_to_metadata_for_test(id);
        q.pick(Stage::Metadata).unwrap();

        q.set_trouble(
            id,
            Trouble::MetadataAmbiguous {
                stubs: vec![crate::metadata::MetadataStub {
                    id: "tt123".into(),
                    title: "A".into(),
                    year: Some(2010),
                    poster_url: None,
                }],
            },
        )
        .unwrap();
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::NeedsResolving);

        q.resolve_trouble(id, TroubleResolution::ChooseStub { stub_id: "tt123".into() })
            .unwrap();
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::Pending);
        assert_eq!(item.stage, Stage::Metadata);
        assert_eq!(item.metadata, MetadataState::Resolved { stub_id: "tt123".into() });
        assert!(item.trouble.is_none());
    }

    #[test]
    fn test_pause_resume() {
        let (q, _dir) = queue();
        let id = push(&q, "/import/a.mkv");

        // Pausing an idle item is illegal.
        assert!(q.pause(id).is_err());

        q.pick(Stage::Import).unwrap();
        q.pause(id).unwrap();
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::Paused);
        q.resume(id).unwrap();
        let (item, _) = q.find(id).unwrap();
        assert_eq!(item.status, Status::Processing);
    }

    #[test]
    fn test_for_each_early_termination() {
        let (q, _dir) = queue();
        push(&q, "/import/a.mkv");
        push(&q, "/import/b.mkv");
        push(&q, "/import/c.mkv");

        let mut visited = 0;
        q.for_each(|_, _| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_filter_returns_removed() {
        let (q, _dir) = queue();
        let a = push(&q, "/import/a.mkv");
        push(&q, "/import/b.mkv");

        q.cancel(a).unwrap();
        let removed = q.filter(|i| !i.status.is_terminal());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, a);
        assert_eq!(q.len(), 1);
    }

    // Test-only helpers for walking items through stages without tasks.
    impl Queue {
        fn pick_any_for_test(&self, id: ItemId) {
            let (item, _) = self.find(id).unwrap();
            let picked = self.pick(item.stage).unwrap();
            assert_eq!(picked.id, id);
        }

        fn advance_to_metadata_for_test(&self, id: ItemId) {
            self.pick_any_for_test(id);
            self.advance_stage(id).unwrap();
        }
    }

    impl Stage {
        fn prev_for_test(&self) -> Stage {
            match self {
                Stage::Title => Stage::Import,
                Stage::Metadata => Stage::Title,
                Stage::Persist => Stage::Metadata,
                Stage::Transcode => Stage::Persist,
                Stage::Completed => Stage::Transcode,
                Stage::Import => unreachable!(),
            }
        }
    }
}
