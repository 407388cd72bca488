//! The muxer child process.
//!
//! An external `ffmpeg` receives raw recorder bytes on stdin and emits
//! fixed-duration HLS segments plus a rewritten playlist into a private
//! scratch directory. Stderr is followed line by line: segment-open
//! markers are informational, error-flagged lines are retained (last 10)
//! for the terminal `streamError` reason.

use crate::error::PipelineError;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, trace, warn};

const ERROR_BACKLOG: usize = 10;
const VIDEO_BITRATE: &str = "2500k";
const VIDEO_BUFSIZE: &str = "5000k";
const AUDIO_BITRATE: &str = "128k";

#[derive(Debug)]
pub struct Muxer {
    child: Child,
    errors: Arc<Mutex<VecDeque<String>>>,
}

impl Muxer {
    /// Spawns the muxer inside `out_dir` with the zero-latency live
    /// profile. The child gets a scrubbed environment; only PATH survives
    /// so the binary can resolve its own tooling.
    pub fn spawn(bin: &str, out_dir: &Path, segment_seconds: u32) -> Result<Self, PipelineError> {
        let mut command = Command::new(bin);
        command
            .args(["-hide_banner", "-nostats"])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency"])
            .args(["-b:v", VIDEO_BITRATE, "-maxrate", VIDEO_BITRATE, "-bufsize", VIDEO_BUFSIZE])
            .args(["-g", "48", "-sc_threshold", "0"])
            .args(["-c:a", "aac", "-b:a", AUDIO_BITRATE])
            .args(["-f", "hls"])
            .args(["-hls_time", &segment_seconds.to_string()])
            .args(["-hls_list_size", "0"])
            .args(["-hls_flags", "append_list+split_by_time"])
            .args(["-hls_segment_filename", crate::keys::SEGMENT_TEMPLATE])
            .arg(crate::keys::MANIFEST_NAME)
            .current_dir(out_dir)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| PipelineError::Muxer(format!("spawn {bin}: {err}")))?;

        let errors = Arc::new(Mutex::new(VecDeque::with_capacity(ERROR_BACKLOG)));
        if let Some(stderr) = child.stderr.take() {
            let errors = errors.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("Opening '") && line.contains("for writing") {
                        debug!(%line, "muxer opened output");
                    } else if is_error_line(&line) {
                        warn!(%line, "muxer stderr");
                        let mut errors = errors.lock().expect("muxer error lock");
                        if errors.len() == ERROR_BACKLOG {
                            errors.pop_front();
                        }
                        errors.push_back(line);
                    } else {
                        trace!(%line, "muxer stderr");
                    }
                }
            });
        }

        Ok(Self { child, errors })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, PipelineError> {
        self.child
            .wait()
            .await
            .map_err(|err| PipelineError::Muxer(format!("wait: {err}")))
    }

    /// Waits up to `grace` for a voluntary exit, then kills. Used after
    /// stdin has been closed, and on forced shutdown.
    pub async fn wait_or_kill(&mut self, grace: Duration) -> Result<ExitStatus, PipelineError> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(|err| PipelineError::Muxer(format!("wait: {err}"))),
            Err(_) => {
                warn!("muxer did not exit within grace period, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|err| PipelineError::Muxer(format!("kill: {err}")))?;
                self.child
                    .wait()
                    .await
                    .map_err(|err| PipelineError::Muxer(format!("wait after kill: {err}")))
            }
        }
    }

    /// The retained stderr error lines, oldest first.
    pub fn recent_errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .expect("muxer error lock")
            .iter()
            .cloned()
            .collect()
    }
}

fn is_error_line(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    lowered.contains("error")
        || lowered.contains("invalid data")
        || lowered.contains("failed")
        || lowered.contains("could not")
}
