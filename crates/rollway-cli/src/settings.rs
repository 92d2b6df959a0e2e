use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rollway_core::Channel;
use rollway_installer::{HookTimeouts, HealthVerifier, MAX_KEEP_COUNT, MIN_KEEP_COUNT};
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_UPDATE_SERVER: &str = "https://updates.rollway.local";
pub(crate) const DEFAULT_HEALTH_URL: &str = "http://localhost:8000/api/v1/health";
const SETTINGS_FILE_VERSION: u32 = 1;

/// Operator settings persisted as `settings.toml` in the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Settings {
    pub(crate) version: u32,
    pub(crate) channel: Channel,
    pub(crate) keep_count: usize,
    pub(crate) auto_update: bool,
    pub(crate) update_server: String,
    pub(crate) health_url: String,
    pub(crate) health_interval_secs: u64,
    pub(crate) health_window_secs: u64,
    pub(crate) probe_timeout_secs: u64,
    pub(crate) request_timeout_secs: u64,
    pub(crate) hook_timeout_secs: u64,
    pub(crate) rollback_hook_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) restart_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ready_command: Option<String>,
    pub(crate) ready_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) config_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_FILE_VERSION,
            channel: Channel::Stable,
            keep_count: rollway_installer::DEFAULT_KEEP_COUNT,
            auto_update: false,
            update_server: DEFAULT_UPDATE_SERVER.to_string(),
            health_url: DEFAULT_HEALTH_URL.to_string(),
            health_interval_secs: rollway_installer::DEFAULT_HEALTH_INTERVAL.as_secs(),
            health_window_secs: rollway_installer::DEFAULT_HEALTH_WINDOW.as_secs(),
            probe_timeout_secs: rollway_installer::DEFAULT_PROBE_TIMEOUT.as_secs(),
            request_timeout_secs: 30,
            hook_timeout_secs: rollway_installer::DEFAULT_HOOK_TIMEOUT.as_secs(),
            rollback_hook_timeout_secs: rollway_installer::DEFAULT_ROLLBACK_HOOK_TIMEOUT
                .as_secs(),
            restart_command: None,
            ready_command: None,
            ready_timeout_secs: rollway_installer::DEFAULT_READY_TIMEOUT.as_secs(),
            config_dir: None,
        }
    }
}

/// Fields `settings set` may change. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SettingsUpdate {
    pub(crate) channel: Option<Channel>,
    pub(crate) keep_count: Option<usize>,
    pub(crate) auto_update: Option<bool>,
    pub(crate) update_server: Option<String>,
    pub(crate) health_url: Option<String>,
}

impl SettingsUpdate {
    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Settings {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_KEEP_COUNT..=MAX_KEEP_COUNT).contains(&self.keep_count) {
            anyhow::bail!(
                "keep_count must be between {MIN_KEEP_COUNT} and {MAX_KEEP_COUNT}, got {}",
                self.keep_count
            );
        }
        if self.update_server.trim().is_empty() {
            anyhow::bail!("update_server must not be empty");
        }
        let health_url = self.health_url.trim();
        if !(health_url.starts_with("http://") || health_url.starts_with("https://")) {
            anyhow::bail!("health_url must be an http(s) URL: '{}'", self.health_url);
        }
        for (name, value) in [
            ("health_interval_secs", self.health_interval_secs),
            ("health_window_secs", self.health_window_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("hook_timeout_secs", self.hook_timeout_secs),
            ("rollback_hook_timeout_secs", self.rollback_hook_timeout_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.health_interval_secs > self.health_window_secs {
            anyhow::bail!(
                "health_interval_secs ({}) must not exceed health_window_secs ({})",
                self.health_interval_secs,
                self.health_window_secs
            );
        }
        Ok(())
    }

    /// Applies `update` and validates the result; `self` is untouched when
    /// the combination is invalid.
    pub(crate) fn apply(&self, update: &SettingsUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(channel) = update.channel {
            next.channel = channel;
        }
        if let Some(keep_count) = update.keep_count {
            next.keep_count = keep_count;
        }
        if let Some(auto_update) = update.auto_update {
            next.auto_update = auto_update;
        }
        if let Some(update_server) = &update.update_server {
            next.update_server = update_server.trim().to_string();
        }
        if let Some(health_url) = &update.health_url {
            next.health_url = health_url.trim().to_string();
        }
        next.validate()?;
        Ok(next)
    }

    pub(crate) fn hook_timeouts(&self) -> HookTimeouts {
        HookTimeouts {
            default: Duration::from_secs(self.hook_timeout_secs),
            rollback: Duration::from_secs(self.rollback_hook_timeout_secs),
        }
    }

    pub(crate) fn verifier(&self) -> HealthVerifier {
        HealthVerifier::new(
            Duration::from_secs(self.health_interval_secs),
            Duration::from_secs(self.health_window_secs),
        )
    }

    pub(crate) fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub(crate) fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub(crate) fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("channel: {}", self.channel),
            format!("keep_count: {}", self.keep_count),
            format!("auto_update: {}", self.auto_update),
            format!("update_server: {}", self.update_server),
            format!("health_url: {}", self.health_url),
            format!(
                "health: every {}s for up to {}s (probe timeout {}s)",
                self.health_interval_secs, self.health_window_secs, self.probe_timeout_secs
            ),
            format!(
                "hook timeouts: {}s (rollback {}s)",
                self.hook_timeout_secs, self.rollback_hook_timeout_secs
            ),
        ];
        lines.push(format!(
            "restart_command: {}",
            self.restart_command.as_deref().unwrap_or("(none)")
        ));
        if let Some(ready) = &self.ready_command {
            lines.push(format!(
                "ready_command: {ready} (timeout {}s)",
                self.ready_timeout_secs
            ));
        }
        if let Some(config_dir) = &self.config_dir {
            lines.push(format!("config_dir: {}", config_dir.display()));
        }
        lines
    }
}

/// Missing file means defaults; a present but invalid file is an error.
pub(crate) fn load_settings(path: &Path) -> Result<Settings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading settings: {}", path.display()))
        }
    };
    let mut settings = parse_settings(&raw)
        .with_context(|| format!("invalid settings file: {}", path.display()))?;
    settings.version = SETTINGS_FILE_VERSION;
    Ok(settings)
}

pub(crate) fn parse_settings(raw: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(raw).context("failed to parse settings")?;
    settings.validate()?;
    Ok(settings)
}

pub(crate) fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating settings directory: {}", parent.display()))?;
    }

    let content = toml::to_string(settings)
        .with_context(|| format!("failed serializing settings: {}", path.display()))?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content)
        .with_context(|| format!("failed writing settings: {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("failed replacing settings: {}", path.display()));
    }
    Ok(())
}
