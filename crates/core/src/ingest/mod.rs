//! Import directory ingestion.
//!
//! Every ingest tick reloads the exclusion cache, walks the import
//! directory, admits new files, reconciles removals (cancelling their
//! transcode tasks), and releases items whose source file has had a stable
//! modification time for the stability window.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapters::{Clock, FileSnapshot, Filesystem};
use crate::queue::{Queue, QueueError, Stage, Status};
use crate::transcode::TranscodeCommander;

/// Modtime stability window before an item leaves the import hold.
pub const STABILITY_WINDOW_SECS: i64 = 120;

/// Ingest tick failures.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The import directory walk failed.
    #[error("failed to scan import directory: {0}")]
    Scan(#[from] io::Error),

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What one tick did; used for logging and idempotence checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub discovered: usize,
    pub admitted: usize,
    pub removed: usize,
    pub released: usize,
}

/// Periodic import-directory scanner.
pub struct Ingestor {
    queue: Arc<Queue>,
    fs: Arc<dyn Filesystem>,
    clock: Arc<dyn Clock>,
    commander: Arc<TranscodeCommander>,
    import_path: PathBuf,
    stability_window: ChronoDuration,
}

impl Ingestor {
    pub fn new(
        queue: Arc<Queue>,
        fs: Arc<dyn Filesystem>,
        clock: Arc<dyn Clock>,
        commander: Arc<TranscodeCommander>,
        import_path: PathBuf,
    ) -> Self {
        Self {
            queue,
            fs,
            clock,
            commander,
            import_path,
            stability_window: ChronoDuration::seconds(STABILITY_WINDOW_SECS),
        }
    }

    /// Override the stability window (tests).
    pub fn with_stability_window(mut self, window: ChronoDuration) -> Self {
        self.stability_window = window;
        self
    }

    /// One synchronisation pass over the import directory.
    pub async fn tick(&self) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();

        // The cache may have been edited or deleted externally.
        self.queue.reload()?;

        let discovered: HashMap<PathBuf, FileSnapshot> = self
            .fs
            .walk(&self.import_path)?
            .into_iter()
            .collect();
        summary.discovered = discovered.len();

        // Admit anything new.
        for (path, snapshot) in &discovered {
            match self.queue.push(path.clone(), *snapshot) {
                Ok(id) => {
                    info!(item = %id, path = %path.display(), "admitted import");
                    summary.admitted += 1;
                }
                Err(QueueError::DuplicatePath(_)) | Err(QueueError::PathExcluded(_)) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to admit item"),
            }
        }

        // Cancel and drop items whose source disappeared. Busy items go
        // through Cancelling and are removed on a later tick, once their
        // tasks have released them.
        let mut vanished = Vec::new();
        self.queue.for_each(|_, item| {
            if !discovered.contains_key(&item.path) && !item.status.is_terminal() {
                vanished.push(item.id);
            }
            true
        });
        for id in vanished {
            debug!(item = %id, "source file removed; cancelling item");
            match self.queue.cancel(id) {
                Ok(_) => self.commander.cancel_for_item(id).await,
                Err(e) => warn!(item = %id, error = %e, "failed to cancel vanished item"),
            }
        }
        summary.removed = self
            .queue
            .filter(|item| {
                discovered.contains_key(&item.path) || !item.status.is_terminal()
            })
            .len();

        // Stability gate: release items whose file has stopped changing.
        let now = self.clock.now();
        let mut ready = Vec::new();
        self.queue.for_each(|_, item| {
            if item.stage != Stage::Import || item.status != Status::Pending {
                return true;
            }
            match self.fs.stat(&item.path) {
                Ok(snapshot) => {
                    if now.signed_duration_since(snapshot.mod_time) >= self.stability_window {
                        ready.push(item.id);
                    }
                }
                Err(e) => {
                    warn!(item = %item.id, error = %e, "failed to stat import file");
                }
            }
            true
        });
        for id in ready {
            match self.queue.advance_stage(id) {
                Ok(_) => {
                    info!(item = %id, "import hold released");
                    summary.released += 1;
                }
                Err(e) => warn!(item = %id, error = %e, "failed to release import hold"),
            }
        }

        Ok(summary)
    }
}
