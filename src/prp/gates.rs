//! Progressive validation gates.
//!
//! After coder execution, up to four gates run in strict order; each must
//! pass before the next runs. A gate is either a shell command (success =
//! exit code 0) or a manual gate (no command; passes when non-gated). Gate
//! subprocesses run in their own process group so one signal reaches the
//! whole tree; on timeout or cancellation the group gets SIGTERM, then
//! SIGKILL after the configured grace period.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::orchestrator::cancel::CancelToken;
use crate::prp::blueprint::ValidationGate;
use crate::prp::checkpoint::GateRecord;

/// Result of running one gate.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub gate: u8,
    pub name: String,
    pub passed: bool,
    pub manual: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl GateOutcome {
    fn manual_pass(gate: &ValidationGate) -> Self {
        Self {
            gate: gate.level,
            name: gate.name.clone(),
            passed: true,
            manual: true,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            cancelled: false,
        }
    }

    /// Persisted form for checkpoints.
    pub fn record(&self) -> GateRecord {
        GateRecord {
            gate: self.gate,
            passed: self.passed,
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            duration_ms: self.duration.as_millis() as u64,
        }
    }

    /// Failure context handed back to the coder on fix-retry.
    pub fn failure_context(&self) -> String {
        format!(
            "Gate {} ({}) failed with exit code {}.\n--- stdout ---\n{}\n--- stderr ---\n{}",
            self.gate,
            if self.name.is_empty() { "unnamed" } else { &self.name },
            self.exit_code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Runs gate commands in the project working directory.
pub struct GateRunner {
    working_dir: std::path::PathBuf,
    config: RunnerConfig,
}

impl GateRunner {
    pub fn new(working_dir: &std::path::Path, config: RunnerConfig) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            config,
        }
    }

    /// Run a single gate to completion, honoring timeout and cancellation.
    pub async fn run(&self, gate: &ValidationGate, cancel: &CancelToken) -> GateOutcome {
        let Some(command) = gate.command.as_deref() else {
            debug!(gate = gate.level, "manual gate, passing");
            return GateOutcome::manual_pass(gate);
        };

        let start = Instant::now();
        let mut outcome = GateOutcome {
            gate: gate.level,
            name: gate.name.clone(),
            passed: false,
            manual: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            cancelled: false,
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                outcome.stderr = format!("failed to spawn gate command: {e}");
                outcome.duration = start.elapsed();
                return outcome;
            }
        };

        let stdout_task = child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            waited = timeout(self.config.gate_timeout(), child.wait()) => match waited {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    outcome.stderr = format!("failed to wait for gate command: {e}");
                    None
                }
                Err(_) => {
                    warn!(gate = gate.level, timeout_secs = self.config.gate_timeout_secs, "gate timed out");
                    outcome.timed_out = true;
                    self.terminate(&mut child).await;
                    None
                }
            },
            _ = cancel.cancelled() => {
                outcome.cancelled = true;
                self.terminate(&mut child).await;
                None
            }
        };

        if let Some(status) = status {
            outcome.exit_code = status.code().unwrap_or(-1);
            outcome.passed = status.success();
        }
        if let Some(task) = stdout_task {
            outcome.stdout = task.await.unwrap_or_default();
        }
        if let Some(task) = stderr_task {
            outcome.stderr = task.await.unwrap_or_default();
        }
        outcome.duration = start.elapsed();
        debug!(
            gate = gate.level,
            passed = outcome.passed,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "gate finished"
        );
        outcome
    }

    /// SIGTERM the process group, escalate to SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) {
        let grace = Duration::from_secs(self.config.kill_grace_secs);
        if let Some(pid) = child.id() {
            signal_group(pid, "-TERM").await;
            if timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            signal_group(pid, "-KILL").await;
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Signal an entire process group via the portable `kill` utility. The gate
/// child is its own group leader, so its pid doubles as the pgid.
async fn signal_group(pid: u32, signal: &str) {
    let _ = Command::new("kill")
        .arg(signal)
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}
