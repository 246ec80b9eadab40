//! Mock transcoder runner.
//!
//! Each `start` call registers a [`MockEncoder`] the test can drive:
//! feed progress, complete or fail it, and inspect the control commands
//! the commander issued. Cancellation is honoured automatically so
//! shutdown paths terminate like a real encoder would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::transcode::{
    EncodeJob, EncodeProgress, RunnerCommand, RunnerError, RunnerExit, RunnerHandle,
    TranscoderRunner,
};

/// One simulated encoder process.
pub struct MockEncoder {
    pub job: EncodeJob,
    progress_tx: mpsc::Sender<EncodeProgress>,
    log_tx: mpsc::Sender<String>,
    done_tx: Mutex<Option<oneshot::Sender<RunnerExit>>>,
    commands: Mutex<Vec<RunnerCommand>>,
}

impl MockEncoder {
    /// Feed a progress sample to the supervisor.
    pub async fn send_progress(&self, fraction: f32) {
        let _ = self
            .progress_tx
            .send(EncodeProgress {
                fraction,
                fps: Some(24.0),
                bitrate: Some("4000kbits/s".to_string()),
                elapsed_secs: 1.0,
            })
            .await;
    }

    /// Emit a diagnostic log line.
    pub async fn send_log(&self, line: impl Into<String>) {
        let _ = self.log_tx.send(line.into()).await;
    }

    /// Finish with the given exit. Safe to call once; later calls no-op.
    pub fn finish(&self, exit: RunnerExit) {
        if let Some(done) = self.done_tx.lock().unwrap().take() {
            let _ = done.send(exit);
        }
    }

    pub fn complete(&self) {
        self.finish(RunnerExit::Completed);
    }

    pub fn fail(&self, code: i32) {
        self.finish(RunnerExit::Failed { code: Some(code) });
    }

    /// Control commands received so far.
    pub fn commands(&self) -> Vec<RunnerCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Whether the encoder has already reported an exit.
    pub fn is_finished(&self) -> bool {
        self.done_tx.lock().unwrap().is_none()
    }
}

/// Mock implementation of [`TranscoderRunner`].
#[derive(Default)]
pub struct MockRunner {
    encoders: Mutex<Vec<Arc<MockEncoder>>>,
    fail_next_start: AtomicBool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` call fail.
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Encoders started so far, in start order.
    pub fn encoders(&self) -> Vec<Arc<MockEncoder>> {
        self.encoders.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.encoders.lock().unwrap().len()
    }

    /// The encoder writing to the given output path, if started.
    pub fn encoder_for_output(&self, output: &std::path::Path) -> Option<Arc<MockEncoder>> {
        self.encoders
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.job.output == output)
            .cloned()
    }

    /// Wait until at least `count` encoders have started.
    pub async fn wait_for_started(&self, count: usize) {
        for _ in 0..200 {
            if self.started_count() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} encoders to start, saw {}",
            self.started_count()
        );
    }
}

#[async_trait]
impl TranscoderRunner for MockRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, job: EncodeJob) -> Result<RunnerHandle, RunnerError> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(RunnerError::BinaryNotFound {
                path: "mock-ffmpeg".into(),
            });
        }

        let (progress_tx, progress_rx) = mpsc::channel(32);
        let (log_tx, log_rx) = mpsc::channel(32);
        let (done_tx, done_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::channel(8);

        let encoder = Arc::new(MockEncoder {
            job,
            progress_tx,
            log_tx,
            done_tx: Mutex::new(Some(done_tx)),
            commands: Mutex::new(Vec::new()),
        });
        self.encoders.lock().unwrap().push(Arc::clone(&encoder));

        // Record control commands; honour cancellation like a real process.
        tokio::spawn(async move {
            while let Some(command) = control_rx.recv().await {
                encoder.commands.lock().unwrap().push(command);
                if command == RunnerCommand::Cancel {
                    encoder.finish(RunnerExit::Cancelled);
                }
            }
        });

        Ok(RunnerHandle::new(progress_rx, log_rx, done_rx, control_tx))
    }

    async fn validate(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}
