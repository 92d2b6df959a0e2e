use std::collections::BTreeSet;
use std::fs;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};
use crate::pointer::read_current;
use crate::store::PackageStore;
use crate::transactions::{read_active_transaction, read_commit_record, read_transaction_metadata};
use crate::DataLayout;

pub const MIN_KEEP_COUNT: usize = 1;
pub const MAX_KEEP_COUNT: usize = 5;
pub const DEFAULT_KEEP_COUNT: usize = 2;
/// Finished transactions whose records and journals survive a prune.
pub const TRANSACTION_HISTORY_KEEP: usize = 20;
pub const HOOK_LOG_KEEP: usize = 50;

pub fn clamp_keep_count(keep_count: usize) -> usize {
    keep_count.clamp(MIN_KEEP_COUNT, MAX_KEEP_COUNT)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub keep_count: usize,
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    /// Versions that could not be deleted, with the reason. These are left
    /// for the next prune.
    pub failed: Vec<(String, String)>,
    /// Transaction ids whose metadata, journal and staging were deleted.
    pub pruned_transactions: Vec<String>,
    pub pruned_hook_logs: usize,
}

/// Deletes installed versions that are not current, not the previous
/// version of the last commit, and not among the `keep_count` most recently
/// installed others.
pub fn prune(store: &PackageStore, keep_count: usize) -> Result<PruneReport> {
    let keep_count = clamp_keep_count(keep_count);
    let layout = store.layout();
    let current = read_current(layout)?;
    let previous = read_commit_record(layout)?.and_then(|record| record.previous);

    let mut installed = store.list_installed()?;
    installed.sort_by(|a, b| {
        b.installed_at_unix()
            .cmp(&a.installed_at_unix())
            .then_with(|| b.version.cmp(&a.version))
    });

    let mut keep = BTreeSet::new();
    keep.extend(current.iter().cloned());
    keep.extend(previous.iter().cloned());
    keep.extend(
        installed
            .iter()
            .map(|entry| entry.version.to_string())
            .filter(|version| Some(version) != current.as_ref())
            .take(keep_count),
    );

    let mut report = PruneReport {
        keep_count,
        ..PruneReport::default()
    };
    for entry in &installed {
        let version = entry.version.to_string();
        if keep.contains(&version) {
            report.kept.push(version);
            continue;
        }
        match store.remove_version(&version) {
            Ok(()) => {
                info!(version = %version, "pruned installed version");
                report.removed.push(version);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(version = %version, error = %reason, "failed to prune installed version");
                report.failed.push((version, reason));
            }
        }
    }

    match prune_transaction_history(layout, TRANSACTION_HISTORY_KEEP) {
        Ok(pruned) => report.pruned_transactions = pruned,
        Err(err) => warn!(error = %format!("{err:#}"), "failed to prune transaction history"),
    }
    match prune_hook_logs(layout, HOOK_LOG_KEEP) {
        Ok(pruned) => report.pruned_hook_logs = pruned,
        Err(err) => warn!(error = %format!("{err:#}"), "failed to prune hook logs"),
    }

    Ok(report)
}

/// Deletes the records of all but the `keep` most recently started
/// transactions. The active transaction and the last commit are never
/// touched; the commit's restore point may live in its staging dir.
pub fn prune_transaction_history(layout: &DataLayout, keep: usize) -> Result<Vec<String>> {
    let dir = layout.transactions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut protected = BTreeSet::new();
    protected.extend(read_active_transaction(layout)?);
    protected.extend(read_commit_record(layout)?.map(|record| record.txid));

    let mut history = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(txid) = name.to_str().and_then(|name| name.strip_suffix(".json")) else {
            continue;
        };
        let started = read_transaction_metadata(layout, txid)
            .ok()
            .flatten()
            .map_or(0, |metadata| metadata.started_at_unix);
        history.push((started, txid.to_string()));
    }
    history.sort_by(|a, b| b.cmp(a));

    let mut pruned = Vec::new();
    for (_, txid) in history.into_iter().skip(keep) {
        if protected.contains(&txid) {
            continue;
        }
        let removed = remove_file_if_exists(&layout.transaction_metadata_path(&txid))
            .and_then(|()| remove_file_if_exists(&layout.transaction_journal_path(&txid)))
            .and_then(|()| remove_dir_if_exists(&layout.transaction_staging_path(&txid)));
        match removed {
            Ok(()) => pruned.push(txid),
            Err(err) => warn!(txid = %txid, error = %err, "failed to prune transaction record"),
        }
    }
    if !pruned.is_empty() {
        info!(count = pruned.len(), "pruned transaction history");
    }
    Ok(pruned)
}

/// Keeps the `keep` newest hook logs.
pub fn prune_hook_logs(layout: &DataLayout, keep: usize) -> Result<usize> {
    let dir = layout.hook_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let mut logs = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        logs.push((modified, path));
    }
    logs.sort_by(|a, b| b.cmp(a));

    let mut pruned = 0;
    for (_, path) in logs.into_iter().skip(keep) {
        match remove_file_if_exists(&path) {
            Ok(()) => pruned += 1,
            Err(err) => warn!(log = %path.display(), error = %err, "failed to prune hook log"),
        }
    }
    Ok(pruned)
}
