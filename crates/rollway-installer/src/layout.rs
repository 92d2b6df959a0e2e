use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CURRENT_POINTER_NAME: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
    config_dir: Option<PathBuf>,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config_dir: None,
        }
    }

    /// Points the shared configuration directory somewhere other than
    /// `<root>/config`.
    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(config_dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    pub fn current_pointer_path(&self) -> PathBuf {
        self.versions_dir().join(CURRENT_POINTER_NAME)
    }

    pub fn staging_version_dir(&self, version: &str, suffix: &str) -> PathBuf {
        self.versions_dir()
            .join(format!(".staging-{version}-{suffix}"))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn download_path(&self, version: &str) -> PathBuf {
        self.downloads_dir().join(format!("{version}.tar.gz"))
    }

    pub fn download_part_path(&self, version: &str) -> PathBuf {
        self.downloads_dir().join(format!("{version}.tar.gz.part"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| self.root.join("config"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn installed_state_dir(&self) -> PathBuf {
        self.state_dir().join("installed")
    }

    pub fn receipt_path(&self, version: &str) -> PathBuf {
        self.installed_state_dir()
            .join(format!("{version}.receipt"))
    }

    pub fn manifest_state_dir(&self) -> PathBuf {
        self.state_dir().join("manifest")
    }

    pub fn hook_logs_dir(&self) -> PathBuf {
        self.state_dir().join("hooks")
    }

    pub fn last_commit_path(&self) -> PathBuf {
        self.state_dir().join("last-commit.json")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_active_path(&self) -> PathBuf {
        self.transactions_dir().join("active")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.versions_dir(),
            self.downloads_dir(),
            self.backups_dir(),
            self.config_dir(),
            self.state_dir(),
            self.installed_state_dir(),
            self.manifest_state_dir(),
            self.hook_logs_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows data directory")?;
        return Ok(PathBuf::from(app_data).join("Rollway"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve data directory")?;
    Ok(PathBuf::from(home).join(".rollway"))
}
