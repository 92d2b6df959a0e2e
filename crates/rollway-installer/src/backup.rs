use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::fs_utils::{copy_dir_recursive, exchange_paths, remove_dir_if_exists, unique_suffix};
use crate::DataLayout;

const BACKUP_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Copies the shared configuration directory into `backups/<timestamp>/`.
/// The snapshot is assembled under a dot-prefixed name and renamed into
/// place, so a listed snapshot is always complete.
pub fn create_backup(layout: &DataLayout) -> Result<PathBuf> {
    let backups = layout.backups_dir();
    fs::create_dir_all(&backups)
        .with_context(|| format!("failed to create {}", backups.display()))?;

    let stamp = Utc::now().format(BACKUP_STAMP_FORMAT).to_string();
    let mut destination = backups.join(&stamp);
    let mut attempt = 1;
    while destination.exists() {
        destination = backups.join(format!("{stamp}-{attempt}"));
        attempt += 1;
    }

    let partial = backups.join(format!(".partial-{}", unique_suffix()));
    let config_dir = layout.config_dir();
    let copied = if config_dir.is_dir() {
        copy_dir_recursive(&config_dir, &partial)
    } else {
        fs::create_dir_all(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))
    };
    if let Err(err) = copied {
        let _ = remove_dir_if_exists(&partial);
        return Err(err).context("backup-failed: could not copy configuration");
    }

    fs::rename(&partial, &destination).with_context(|| {
        format!(
            "backup-failed: could not finalize {} -> {}",
            partial.display(),
            destination.display()
        )
    })?;
    info!(backup = %destination.display(), "configuration backed up");
    Ok(destination)
}

/// Complete snapshots, oldest first.
pub fn list_backups(layout: &DataLayout) -> Result<Vec<PathBuf>> {
    let dir = layout.backups_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in
        fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        backups.push(entry.path());
    }
    backups.sort();
    Ok(backups)
}

pub fn latest_backup(layout: &DataLayout) -> Result<Option<PathBuf>> {
    Ok(list_backups(layout)?.pop())
}

/// Replaces `config_dir` with an exact copy of `snapshot`. The copy is built
/// beside the live directory and swapped in. On Linux the swap is a single
/// `renameat2(RENAME_EXCHANGE)`, so `config_dir` always exists. Elsewhere,
/// or on filesystems without exchange support, the live directory is moved
/// aside first and is briefly absent between the two renames.
pub fn restore_backup(snapshot: &Path, config_dir: &Path) -> Result<()> {
    if !snapshot.is_dir() {
        anyhow::bail!("restore-failed: snapshot missing: {}", snapshot.display());
    }
    let parent = config_dir
        .parent()
        .with_context(|| format!("config directory has no parent: {}", config_dir.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let name = config_dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("config");
    let suffix = unique_suffix();
    let incoming = parent.join(format!(".{name}.restore-{suffix}"));
    let outgoing = parent.join(format!(".{name}.old-{suffix}"));

    if let Err(err) = copy_dir_recursive(snapshot, &incoming) {
        let _ = remove_dir_if_exists(&incoming);
        return Err(err).context("restore-failed: could not copy snapshot");
    }

    if config_dir.exists() {
        match exchange_paths(&incoming, config_dir) {
            Ok(true) => {
                remove_dir_if_exists(&incoming)
                    .with_context(|| format!("failed to remove {}", incoming.display()))?;
            }
            Ok(false) => swap_by_rename(&incoming, &outgoing, config_dir)?,
            Err(err) => {
                let _ = remove_dir_if_exists(&incoming);
                return Err(err).with_context(|| {
                    format!("restore-failed: could not exchange {}", config_dir.display())
                });
            }
        }
    } else if let Err(err) = fs::rename(&incoming, config_dir) {
        let _ = remove_dir_if_exists(&incoming);
        return Err(err).with_context(|| {
            format!("restore-failed: could not install {}", config_dir.display())
        });
    }

    info!(snapshot = %snapshot.display(), config = %config_dir.display(), "configuration restored");
    Ok(())
}

fn swap_by_rename(incoming: &Path, outgoing: &Path, config_dir: &Path) -> Result<()> {
    if let Err(err) = fs::rename(config_dir, outgoing) {
        let _ = remove_dir_if_exists(incoming);
        return Err(err).with_context(|| {
            format!("restore-failed: could not move aside {}", config_dir.display())
        });
    }
    if let Err(err) = fs::rename(incoming, config_dir) {
        let _ = fs::rename(outgoing, config_dir);
        let _ = remove_dir_if_exists(incoming);
        return Err(err).with_context(|| {
            format!("restore-failed: could not install {}", config_dir.display())
        });
    }
    remove_dir_if_exists(outgoing)
        .with_context(|| format!("failed to remove {}", outgoing.display()))
}

/// Copies the live configuration to `destination` as a restore point.
pub fn stash_config(config_dir: &Path, destination: &Path) -> Result<()> {
    remove_dir_if_exists(destination)
        .with_context(|| format!("failed to clear {}", destination.display()))?;
    if config_dir.is_dir() {
        copy_dir_recursive(config_dir, destination)
    } else {
        fs::create_dir_all(destination)
            .with_context(|| format!("failed to create {}", destination.display()))
    }
}
