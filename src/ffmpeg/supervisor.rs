//! Process Supervisor: launches FFmpeg, parses progress off stderr,
//! and guarantees reaping on completion or cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::SessionStatus;
use crate::error::CoreError;

const KILL_GRACE: Duration = Duration::from_secs(10);

/// Outcome reported back to the Session Manager when the child exits or the
/// supervisor gives up on it.
#[derive(Debug, Clone)]
pub enum SupervisorOutcome {
    Complete,
    Stopped,
    Failed { reason: String },
}

pub struct ProcessSupervisor {
    ffmpeg_path: String,
    stall_timeout: Duration,
}

struct ProgressLine {
    seconds_out: Option<f64>,
}

fn parse_progress_line(line: &str, time_re: &Regex) -> ProgressLine {
    let seconds_out = time_re.captures(line).and_then(|caps| {
        let h: f64 = caps.get(1)?.as_str().parse().ok()?;
        let m: f64 = caps.get(2)?.as_str().parse().ok()?;
        let s: f64 = caps.get(3)?.as_str().parse().ok()?;
        Some(h * 3600.0 + m * 60.0 + s)
    });
    ProgressLine { seconds_out }
}

impl ProcessSupervisor {
    pub fn new(ffmpeg_path: impl Into<String>, stall_timeout: Duration) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into(), stall_timeout }
    }

    /// Launches FFmpeg with `args`, streams stderr for progress, and drives
    /// the child to completion or cancellation. `duration_s` is the source
    /// duration used to compute `percent`; `on_progress` is called on every
    /// parsed progress line with a monotonically non-decreasing percent.
    pub async fn run(
        &self,
        args: &[String],
        working_dir: &PathBuf,
        duration_s: f64,
        cancel: CancellationToken,
        on_progress: impl Fn(f64) + Send + 'static,
    ) -> Result<(SupervisorOutcome, Option<u32>), CoreError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::LaunchFailed(format!("exec ffmpeg: {}", e)))?;
        let pid = child.id();

        let stderr = child.stderr.take().expect("stderr piped");
        let mut lines = BufReader::new(stderr).lines();
        let time_re = Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").expect("valid regex");

        let mut last_progress_at = tokio::time::Instant::now();
        let mut last_percent = 0.0_f64;
        let mut stderr_tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok((self.terminate(&mut child).await, pid));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            if stderr_tail.len() >= 20 {
                                stderr_tail.remove(0);
                            }
                            stderr_tail.push(text.clone());

                            let parsed = parse_progress_line(&text, &time_re);
                            if let Some(seconds_out) = parsed.seconds_out {
                                last_progress_at = tokio::time::Instant::now();
                                if duration_s > 0.0 {
                                    let percent = (seconds_out / duration_s * 100.0).clamp(0.0, 100.0);
                                    let percent = percent.max(last_percent);
                                    last_percent = percent;
                                    on_progress(percent);
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading ffmpeg stderr");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if last_progress_at.elapsed() > self.stall_timeout {
                        warn!(stall_secs = self.stall_timeout.as_secs(), "ffmpeg progress stalled");
                        let _ = self.terminate(&mut child).await;
                        return Ok((
                            SupervisorOutcome::Failed { reason: "progress stalled".to_string() },
                            pid,
                        ));
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::TranscodeFailed(format!("waiting on ffmpeg: {}", e)))?;

        let outcome = if status.success() {
            info!(pid = ?pid, "ffmpeg exited cleanly");
            SupervisorOutcome::Complete
        } else {
            match status.code() {
                Some(code) => {
                    let tail = stderr_tail.join("\n");
                    warn!(pid = ?pid, code, "ffmpeg exited non-zero");
                    SupervisorOutcome::Failed { reason: format!("exit code {}: {}", code, tail) }
                }
                None => {
                    debug!(pid = ?pid, "ffmpeg terminated by signal");
                    SupervisorOutcome::Stopped
                }
            }
        };
        Ok((outcome, pid))
    }

    /// SIGTERM now, SIGKILL after [KILL_GRACE] if the process hasn't exited.
    async fn terminate(&self, child: &mut tokio::process::Child) -> SupervisorOutcome {
        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => SupervisorOutcome::Stopped,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                SupervisorOutcome::Stopped
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

pub fn status_for_outcome(outcome: &SupervisorOutcome) -> SessionStatus {
    match outcome {
        SupervisorOutcome::Complete => SessionStatus::Complete,
        SupervisorOutcome::Stopped => SessionStatus::Stopped,
        SupervisorOutcome::Failed { .. } => SessionStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hms_timecode() {
        let re = Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap();
        let parsed = parse_progress_line("frame=100 fps=25 time=00:01:30.50 speed=1.2x", &re);
        assert_eq!(parsed.seconds_out, Some(90.5));
    }

    #[test]
    fn missing_time_field_yields_none() {
        let re = Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap();
        let parsed = parse_progress_line("frame=100 fps=25", &re);
        assert_eq!(parsed.seconds_out, None);
    }

    #[test]
    fn status_mapping_matches_state_machine() {
        assert_eq!(status_for_outcome(&SupervisorOutcome::Complete), SessionStatus::Complete);
        assert_eq!(status_for_outcome(&SupervisorOutcome::Stopped), SessionStatus::Stopped);
        assert_eq!(
            status_for_outcome(&SupervisorOutcome::Failed { reason: "x".into() }),
            SessionStatus::Failed
        );
    }
}
