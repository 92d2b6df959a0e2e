use std::fmt;

use anyhow::{anyhow, Result};
use rollway_core::Channel;
use serde::{Deserialize, Serialize};

/// Local record of one installed version, written once extraction succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub version: String,
    pub channel: Channel,
    pub release_date: Option<String>,
    pub checksum: String,
    pub size: Option<u64>,
    pub file_count: usize,
    pub installed_at_unix: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Rollback,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "install" => Ok(Self::Install),
            "rollback" => Ok(Self::Rollback),
            _ => Err(anyhow!("invalid operation: {value}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of one activation. `RolledBack` is only ever recorded on a
/// finished transition record; the controller itself returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    Idle,
    Fetching,
    Verifying,
    Extracting,
    PreUpgradeHook,
    BackingUp,
    Activating,
    PostUpgradeHook,
    Restarting,
    HealthChecking,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TransitionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::PreUpgradeHook => "pre_upgrade_hook",
            Self::BackingUp => "backing_up",
            Self::Activating => "activating",
            Self::PostUpgradeHook => "post_upgrade_hook",
            Self::Restarting => "restarting",
            Self::HealthChecking => "health_checking",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: Operation,
    pub target_version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    pub state: TransitionState,
    pub started_at_unix: u64,
    #[serde(default)]
    pub updated_at_unix: u64,
    /// Directory holding the configuration to restore if the transition is
    /// unwound.
    #[serde(default)]
    pub restore_point: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: TransitionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub txid: String,
    pub operation: Operation,
    pub current: String,
    #[serde(default)]
    pub previous: Option<String>,
    /// Configuration snapshot taken before this commit, i.e. the
    /// configuration `previous` was running with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point: Option<String>,
    pub committed_at_unix: u64,
}
