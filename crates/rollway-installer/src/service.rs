use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rollway_core::UpdateError;
use tracing::{debug, info};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Restarts the managed service and waits until it reports running.
pub trait ServiceController: Send + Sync {
    fn restart(&self) -> Result<()>;
}

/// Used when no restart command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceController;

impl ServiceController for NoopServiceController {
    fn restart(&self) -> Result<()> {
        debug!("no restart command configured; skipping service restart");
        Ok(())
    }
}

/// Runs shell command lines: one to restart, and optionally one polled until
/// it exits 0. Both share a single ready deadline.
#[derive(Debug, Clone)]
pub struct CommandServiceController {
    restart_command: String,
    ready_command: Option<String>,
    ready_timeout: Duration,
}

impl CommandServiceController {
    pub fn new(
        restart_command: impl Into<String>,
        ready_command: Option<String>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            restart_command: restart_command.into(),
            ready_command,
            ready_timeout,
        }
    }

    fn not_ready(&self, detail: String) -> anyhow::Error {
        UpdateError::ServiceNotReady {
            detail: format!("{detail} (ready timeout {}s)", self.ready_timeout.as_secs_f32()),
        }
        .into()
    }
}

impl ServiceController for CommandServiceController {
    fn restart(&self) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.ready_timeout;
        info!(command = %self.restart_command, "restarting service");

        match run_until(&self.restart_command, deadline)? {
            Some(status) if status.success() => {}
            Some(status) => {
                return Err(self.not_ready(format!("restart command exited with {status}")))
            }
            None => return Err(self.not_ready("restart command did not finish".to_string())),
        }

        let Some(ready_command) = &self.ready_command else {
            return Ok(());
        };
        loop {
            let last = match run_until(ready_command, deadline)? {
                Some(status) if status.success() => {
                    info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "service ready"
                    );
                    return Ok(());
                }
                Some(status) => format!("ready command exited with {status}"),
                None => "ready command did not finish".to_string(),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(self.not_ready(last));
            }
            thread::sleep(READY_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Runs `command_line`, killing it once `deadline` passes. `None` means it
/// was killed.
fn run_until(command_line: &str, deadline: Instant) -> Result<Option<ExitStatus>> {
    let mut child = shell(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to run '{command_line}'"))?;

    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed checking '{command_line}'"))?
        {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(not(unix))]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}
