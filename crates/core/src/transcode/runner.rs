//! External encoder processes.
//!
//! [`TranscoderRunner`] spawns one encoder per job and hands back a
//! single-use [`RunnerHandle`]: a progress stream, a diagnostic log stream,
//! a control surface (pause/resume/cancel) and a completion future. The
//! bundled implementation drives ffmpeg, parsing its `-progress` key/value
//! output from stderr and controlling the process with POSIX signals.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::workflow::FfmpegOptions;

/// Capacity of the progress channel; stale updates are dropped.
const PROGRESS_CAPACITY: usize = 32;
/// Capacity of the diagnostic log channel.
const LOG_CAPACITY: usize = 128;
/// How long a cancelled encoder gets before it is killed outright.
const CANCEL_KILL_AFTER: Duration = Duration::from_secs(5);

/// One encoding invocation.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: FfmpegOptions,
}

/// A progress sample from a running encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeProgress {
    /// Completed fraction, 0.0 to 1.0. Opaque: derived from the encoder's
    /// own time reporting against the probed input duration.
    pub fraction: f32,
    pub fps: Option<f32>,
    pub bitrate: Option<String>,
    /// Wall-clock seconds since the encoder started.
    pub elapsed_secs: f64,
}

/// Terminal state of an encoder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    Completed,
    Cancelled,
    Failed { code: Option<i32> },
}

/// Control messages accepted by a running encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    Pause,
    Resume,
    Cancel,
}

/// Errors starting or validating a runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The encoder binary is missing.
    #[error("encoder binary not found: {path}")]
    BinaryNotFound { path: PathBuf },

    /// The output directory could not be created.
    #[error("failed to create output directory {path}: {reason}")]
    OutputDirectoryFailed { path: PathBuf, reason: String },

    /// I/O failure spawning or talking to the process.
    #[error("encoder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Single-use handle to a spawned encoder.
pub struct RunnerHandle {
    /// Progress samples, most recent wins; the channel drops samples when
    /// the consumer lags.
    pub progress: mpsc::Receiver<EncodeProgress>,
    /// Raw encoder log lines for diagnostics.
    pub logs: mpsc::Receiver<String>,
    /// Resolves exactly once with the process's terminal state.
    pub done: oneshot::Receiver<RunnerExit>,
    control: mpsc::Sender<RunnerCommand>,
}

impl RunnerHandle {
    /// Assemble a handle from its channel halves. Mock runners use this to
    /// hand tests direct control of the "encoder".
    pub fn new(
        progress: mpsc::Receiver<EncodeProgress>,
        logs: mpsc::Receiver<String>,
        done: oneshot::Receiver<RunnerExit>,
        control: mpsc::Sender<RunnerCommand>,
    ) -> Self {
        Self {
            progress,
            logs,
            done,
            control,
        }
    }

    pub async fn pause(&self) {
        let _ = self.control.send(RunnerCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.control.send(RunnerCommand::Resume).await;
    }

    pub async fn cancel(&self) {
        let _ = self.control.send(RunnerCommand::Cancel).await;
    }

    /// Clone of the control sender, for supervisors that need to issue
    /// commands while the receivers are being drained elsewhere.
    pub fn control(&self) -> mpsc::Sender<RunnerCommand> {
        self.control.clone()
    }
}

/// Spawns and controls external encoder processes.
#[async_trait]
pub trait TranscoderRunner: Send + Sync {
    /// Name of this runner implementation.
    fn name(&self) -> &str;

    /// Start one encoder for the job. Handles are single-use.
    async fn start(&self, job: EncodeJob) -> Result<RunnerHandle, RunnerError>;

    /// Verify the runner is usable (binaries present). Failure here is
    /// fatal at startup.
    async fn validate(&self) -> Result<(), RunnerError>;
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Path to the ffmpeg binary.
    pub ffmpeg_path: PathBuf,
    /// Path to the ffprobe binary.
    pub ffprobe_path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// FFmpeg-backed runner.
pub struct FfmpegRunner {
    config: RunnerConfig,
}

impl FfmpegRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Builds the ffmpeg argument list for a job.
    fn build_args(job: &EncodeJob) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            job.input.to_string_lossy().to_string(),
        ];

        match &job.options.video_codec {
            Some(codec) => args.extend(["-c:v".to_string(), codec.clone()]),
            None => args.extend(["-c:v".to_string(), "copy".to_string()]),
        }
        match &job.options.audio_codec {
            Some(codec) => args.extend(["-c:a".to_string(), codec.clone()]),
            None => args.extend(["-c:a".to_string(), "copy".to_string()]),
        }
        if let Some(bitrate) = job.options.video_bitrate_kbps {
            args.extend(["-b:v".to_string(), format!("{}k", bitrate)]);
        }
        args.extend(job.options.filter_args.iter().cloned());

        args.extend([
            "-loglevel".to_string(),
            "error".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ]);

        args.push(job.output.to_string_lossy().to_string());
        args
    }

    /// Probe the input duration for progress fraction calculation.
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: ProbeFormat,
        }
        #[derive(Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
        }

        let output = Command::new(&self.config.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let probe: ProbeOutput = serde_json::from_slice(&output.stdout).ok()?;
        probe.format.duration.as_deref()?.parse().ok()
    }
}

#[async_trait]
impl TranscoderRunner for FfmpegRunner {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn start(&self, job: EncodeJob) -> Result<RunnerHandle, RunnerError> {
        if let Some(parent) = job.output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RunnerError::OutputDirectoryFailed {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        }

        let duration_secs = self.probe_duration(&job.input).await;
        let args = Self::build_args(&job);
        debug!(input = %job.input.display(), output = %job.output.display(), "starting encoder");

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RunnerError::BinaryNotFound {
                        path: self.config.ffmpeg_path.clone(),
                    }
                } else {
                    RunnerError::Io(e)
                }
            })?;

        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                let _ = child.kill().await;
                return Err(RunnerError::Io(std::io::Error::other(
                    "encoder stderr was not captured",
                )));
            }
        };

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(LOG_CAPACITY);
        let (control_tx, mut control_rx) = mpsc::channel::<RunnerCommand>(8);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let pid = child.id();
            let started = Instant::now();
            let mut lines = BufReader::new(stderr).lines();
            let mut cancelled = false;
            let mut kill_deadline: Option<Instant> = None;

            let time_re = Regex::new(r"out_time_ms=(\d+)").ok();
            let fps_re = Regex::new(r"fps=([\d.]+)").ok();
            let bitrate_re = Regex::new(r"bitrate=\s*(\S+)").ok();
            let mut fps = None;
            let mut bitrate = None;

            let exit = loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else {
                            // Stderr closed: the process is exiting.
                            break wait_for_exit(&mut child, cancelled).await;
                        };
                        if let Some(caps) = fps_re.as_ref().and_then(|re| re.captures(&line)) {
                            fps = caps.get(1).and_then(|m| m.as_str().parse().ok());
                        }
                        if let Some(caps) = bitrate_re.as_ref().and_then(|re| re.captures(&line)) {
                            bitrate = caps.get(1).map(|m| m.as_str().to_string());
                        }
                        if let Some(caps) = time_re.as_ref().and_then(|re| re.captures(&line)) {
                            let out_time_secs = caps
                                .get(1)
                                .and_then(|m| m.as_str().parse::<f64>().ok())
                                .map(|us| us / 1_000_000.0)
                                .unwrap_or(0.0);
                            let fraction = match duration_secs {
                                Some(total) if total > 0.0 => {
                                    ((out_time_secs / total) as f32).min(1.0)
                                }
                                _ => 0.0,
                            };
                            // Drop the sample rather than block the encoder.
                            let _ = progress_tx.try_send(EncodeProgress {
                                fraction,
                                fps,
                                bitrate: bitrate.clone(),
                                elapsed_secs: started.elapsed().as_secs_f64(),
                            });
                        } else if !line.trim().is_empty() && !line.contains('=') {
                            let _ = log_tx.try_send(line);
                        }
                    }
                    Some(cmd) = control_rx.recv() => {
                        if let Some(pid) = pid {
                            match cmd {
                                RunnerCommand::Pause => signal_process(pid, nix::sys::signal::Signal::SIGSTOP),
                                RunnerCommand::Resume => signal_process(pid, nix::sys::signal::Signal::SIGCONT),
                                RunnerCommand::Cancel => {
                                    cancelled = true;
                                    kill_deadline = Some(Instant::now() + CANCEL_KILL_AFTER);
                                    // A stopped process cannot handle the
                                    // interrupt; continue it first.
                                    signal_process(pid, nix::sys::signal::Signal::SIGCONT);
                                    signal_process(pid, nix::sys::signal::Signal::SIGINT);
                                }
                            }
                        }
                    }
                    _ = deadline_sleep(kill_deadline), if kill_deadline.is_some() => {
                        warn!("encoder ignored cancellation; killing");
                        let _ = child.kill().await;
                        kill_deadline = None;
                    }
                }
            };

            let _ = done_tx.send(exit);
        });

        Ok(RunnerHandle::new(progress_rx, log_rx, done_rx, control_tx))
    }

    async fn validate(&self) -> Result<(), RunnerError> {
        for path in [&self.config.ffmpeg_path, &self.config.ffprobe_path] {
            let result = Command::new(path).arg("-version").output().await;
            match result {
                Ok(output) if output.status.success() => {}
                Ok(_) | Err(_) => {
                    return Err(RunnerError::BinaryNotFound { path: path.clone() });
                }
            }
        }
        Ok(())
    }
}

async fn wait_for_exit(child: &mut tokio::process::Child, cancelled: bool) -> RunnerExit {
    match child.wait().await {
        Ok(status) => {
            if cancelled {
                RunnerExit::Cancelled
            } else if status.success() {
                RunnerExit::Completed
            } else {
                RunnerExit::Failed {
                    code: status.code(),
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to reap encoder process");
            RunnerExit::Failed { code: None }
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn signal_process(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, ?signal, error = %e, "failed to signal encoder");
    }
}
