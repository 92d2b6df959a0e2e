use anyhow::{Context, Result};
use rollway_core::UpdateError;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::fs_utils::{unique_suffix, write_atomic};
use crate::{CommitRecord, DataLayout, Operation, TransactionJournalEntry, TransactionMetadata};

pub(crate) const TRANSACTION_METADATA_VERSION: u32 = 1;

pub fn new_txid(operation: Operation) -> String {
    format!("{}-{}", operation.as_str(), unique_suffix())
}

/// Claims the single-writer marker. Fails with `AlreadyInProgress` when any
/// transition, in this process or another, holds it.
pub fn set_active_transaction(layout: &DataLayout, txid: &str) -> Result<PathBuf> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_transaction(layout).ok().flatten();
            let status = existing
                .as_deref()
                .and_then(|existing| read_transaction_metadata(layout, existing).ok().flatten())
                .map(|metadata| metadata.state.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(UpdateError::AlreadyInProgress {
                txid: existing.unwrap_or_else(|| "unknown".to_string()),
                status,
            }
            .into());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to claim active transaction file: {}",
                    path.display()
                )
            });
        }
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .with_context(|| {
            format!(
                "failed to write active transaction file: {}",
                path.display()
            )
        })?;
    file.flush().with_context(|| {
        format!(
            "failed to flush active transaction file: {}",
            path.display()
        )
    })?;

    Ok(path)
}

pub fn read_active_transaction(layout: &DataLayout) -> Result<Option<String>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active transaction file: {}", path.display())
            });
        }
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }

    Ok(Some(txid.to_string()))
}

pub fn clear_active_transaction(layout: &DataLayout) -> Result<()> {
    let path = layout.transaction_active_path();
    if path.exists() {
        fs::remove_file(&path).with_context(|| {
            format!(
                "failed to clear active transaction file: {}",
                path.display()
            )
        })?;
    }
    Ok(())
}

pub fn write_transaction_metadata(
    layout: &DataLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    let staging = layout.transaction_staging_path(&metadata.txid);
    fs::create_dir_all(&staging).with_context(|| {
        format!(
            "failed to create transaction staging dir: {}",
            staging.display()
        )
    })?;

    let content = serde_json::to_vec_pretty(metadata)
        .context("failed serializing transaction metadata")?;
    write_atomic(&path, &content).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &DataLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn append_transaction_journal_entry(
    layout: &DataLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let line = serde_json::to_string(entry).context("failed serializing journal entry")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.write_all(b"\n").with_context(|| {
        format!(
            "failed to append transaction journal newline: {}",
            path.display()
        )
    })?;
    file.flush()
        .with_context(|| format!("failed to flush transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_transaction_journal(
    layout: &DataLayout,
    txid: &str,
) -> Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()))
        }
    };

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| {
                format!("invalid transaction journal line in {}", path.display())
            })
        })
        .collect()
}

pub fn write_commit_record(layout: &DataLayout, record: &CommitRecord) -> Result<PathBuf> {
    let path = layout.last_commit_path();
    let content = serde_json::to_vec_pretty(record).context("failed serializing commit record")?;
    write_atomic(&path, &content)
        .with_context(|| format!("failed to write commit record: {}", path.display()))?;
    Ok(path)
}

pub fn read_commit_record(layout: &DataLayout) -> Result<Option<CommitRecord>> {
    let path = layout.last_commit_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read commit record: {}", path.display()))
        }
    };
    let record = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing commit record: {}", path.display()))?;
    Ok(Some(record))
}
