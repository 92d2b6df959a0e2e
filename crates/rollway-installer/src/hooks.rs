use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rollway_core::UpdateError;
use tracing::{info, warn};

use crate::fs_utils::unique_suffix;

pub const HOOKS_DIR_NAME: &str = "hooks";
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ROLLBACK_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOG_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    Rollback,
}

impl HookName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookTimeouts {
    pub default: Duration,
    pub rollback: Duration,
}

impl Default for HookTimeouts {
    fn default() -> Self {
        Self {
            default: DEFAULT_HOOK_TIMEOUT,
            rollback: DEFAULT_ROLLBACK_HOOK_TIMEOUT,
        }
    }
}

impl HookTimeouts {
    pub fn for_hook(&self, hook: HookName) -> Duration {
        match hook {
            HookName::Rollback => self.rollback,
            _ => self.default,
        }
    }
}

/// The fixed set of values a hook can see. Nothing else from the manager's
/// environment leaks through apart from `PATH` and `HOME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEnv {
    pub version: String,
    pub previous_version: Option<String>,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
}

impl HookEnv {
    fn vars(&self, hook: HookName) -> Vec<(&'static str, OsString)> {
        let mut vars = Vec::with_capacity(8);
        for key in ["PATH", "HOME"] {
            if let Some(value) = std::env::var_os(key) {
                vars.push((key, value));
            }
        }
        vars.push(("ROLLWAY_HOOK", hook.as_str().into()));
        vars.push(("ROLLWAY_VERSION", self.version.clone().into()));
        vars.push((
            "ROLLWAY_PREVIOUS_VERSION",
            self.previous_version.clone().unwrap_or_default().into(),
        ));
        vars.push(("ROLLWAY_DATA_DIR", self.data_dir.clone().into_os_string()));
        vars.push((
            "ROLLWAY_CONFIG_DIR",
            self.config_dir.clone().into_os_string(),
        ));
        vars.push((
            "ROLLWAY_BACKUP_DIR",
            self.backup_dir
                .clone()
                .map(PathBuf::into_os_string)
                .unwrap_or_default(),
        ));
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The version ships no script for this hook.
    Skipped,
    Succeeded { script: PathBuf, elapsed: Duration },
}

#[derive(Debug, Clone)]
pub struct HookRunner {
    timeouts: HookTimeouts,
    log_dir: PathBuf,
}

impl HookRunner {
    pub fn new(timeouts: HookTimeouts, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            timeouts,
            log_dir: log_dir.into(),
        }
    }

    pub fn timeouts(&self) -> HookTimeouts {
        self.timeouts
    }

    /// Runs `hook` from `version_dir/hooks/`. A missing script succeeds;
    /// a non-zero exit or an overrun is a `HookFailure`.
    pub fn run(&self, hook: HookName, version_dir: &Path, env: &HookEnv) -> Result<HookOutcome> {
        let Some(script) = find_hook_script(version_dir, hook) else {
            return Ok(HookOutcome::Skipped);
        };
        let script = fs::canonicalize(&script).unwrap_or(script);

        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        let log_path = self.log_dir.join(format!(
            "{}-{}-{}.log",
            hook.as_str(),
            env.version,
            unique_suffix()
        ));
        let log = File::create(&log_path)
            .with_context(|| format!("failed to create hook log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("failed to share hook log {}", log_path.display()))?;

        let mut command = hook_command(&script);
        command
            .current_dir(version_dir)
            .env_clear()
            .envs(env.vars(hook))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let timeout = self.timeouts.for_hook(hook);
        info!(hook = %hook, version = %env.version, script = %script.display(), "running hook");
        let started = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            anyhow::Error::from(UpdateError::HookFailure {
                hook: hook.as_str().to_string(),
                detail: format!("failed to start {}: {err}", script.display()),
            })
        })?;

        loop {
            let status = child
                .try_wait()
                .with_context(|| format!("failed checking hook {}", script.display()))?;
            if let Some(status) = status {
                let elapsed = started.elapsed();
                if status.success() {
                    info!(hook = %hook, elapsed_ms = elapsed.as_millis() as u64, "hook succeeded");
                    return Ok(HookOutcome::Succeeded { script, elapsed });
                }
                let detail = format!("exited with {status}{}", log_tail(&log_path));
                warn!(hook = %hook, detail = %detail, "hook failed");
                return Err(UpdateError::HookFailure {
                    hook: hook.as_str().to_string(),
                    detail,
                }
                .into());
            }

            if started.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                let detail = format!("timed out after {}s", timeout.as_secs_f32());
                warn!(hook = %hook, detail = %detail, "hook killed");
                return Err(UpdateError::HookFailure {
                    hook: hook.as_str().to_string(),
                    detail,
                }
                .into());
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

pub fn find_hook_script(version_dir: &Path, hook: HookName) -> Option<PathBuf> {
    let dir = version_dir.join(HOOKS_DIR_NAME);
    [
        dir.join(hook.as_str()),
        dir.join(format!("{}.sh", hook.as_str())),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn hook_command(script: &Path) -> Command {
    use std::os::unix::fs::PermissionsExt;

    let executable = fs::metadata(script)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        return Command::new(script);
    }
    let mut command = Command::new("sh");
    command.arg(script);
    command
}

#[cfg(not(unix))]
fn hook_command(script: &Path) -> Command {
    Command::new(script)
}

fn log_tail(path: &Path) -> String {
    let Ok(raw) = fs::read(path) else {
        return String::new();
    };
    let start = raw.len().saturating_sub(LOG_TAIL_BYTES);
    let text = String::from_utf8_lossy(&raw[start..]);
    let text = text.trim();
    if text.is_empty() {
        String::new()
    } else {
        format!(": {text}")
    }
}
